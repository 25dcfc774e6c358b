//! Secure wallet implementation
//!
//! SECURITY: This is the ONLY place where private keys exist.
//! - Keys are held in ed25519-dalek's SigningKey
//! - Keys are never serialized
//! - Keys are never logged (Debug is redacted)

use super::WalletError;
use ed25519_dalek::{Signer, SigningKey};
use secrecy::{ExposeSecret, SecretString};

/// Anything that can sign a Solana transaction message
///
/// Signing takes `&self`: key material is read-only, so concurrent signing for
/// the same wallet needs no serialization.
pub trait TransactionSigner: Send + Sync {
    /// Raw 32-byte public key
    fn pubkey(&self) -> [u8; 32];

    /// Sign serialized message bytes, returning a 64-byte ed25519 signature
    fn sign_message(&self, message: &[u8]) -> [u8; 64];

    /// Base58 address of the signer
    fn address(&self) -> String {
        bs58::encode(self.pubkey()).into_string()
    }
}

/// Secure wallet that protects the agent's private key
pub struct SecureWallet {
    /// The signer
    signing_key: SigningKey,
    /// Base58 public address (safe to expose)
    address: String,
}

impl SecureWallet {
    /// Create a wallet from a base58-encoded secret
    ///
    /// Accepts both the 64-byte keypair form (secret || public) exported by
    /// Solana wallets and a bare 32-byte seed.
    pub fn from_base58(secret: &SecretString) -> Result<Self, WalletError> {
        let bytes = bs58::decode(secret.expose_secret().trim())
            .into_vec()
            .map_err(|e| WalletError::InvalidKey(format!("not base58: {}", e)))?;

        let signing_key = match bytes.len() {
            64 => {
                let mut keypair = [0u8; 64];
                keypair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&keypair).map_err(|_| {
                    WalletError::InvalidKey("public half does not match secret".to_string())
                })?
            }
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                SigningKey::from_bytes(&seed)
            }
            n => {
                return Err(WalletError::InvalidKey(format!(
                    "expected 32 or 64 bytes, got {}",
                    n
                )))
            }
        };

        Ok(Self::from_signing_key(signing_key))
    }

    /// Wrap an existing signing key
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();
        Self {
            signing_key,
            address,
        }
    }

    /// Get the public address (safe to share)
    pub fn address_string(&self) -> &str {
        &self.address
    }
}

impl TransactionSigner for SecureWallet {
    fn pubkey(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    fn sign_message(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

// Implement Debug manually to avoid exposing the key
impl std::fmt::Debug for SecureWallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureWallet")
            .field("address", &self.address)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}
