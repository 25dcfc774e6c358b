//! Signer lookup per agent
//!
//! Wallet storage lives outside this crate; the supervisor only needs a way to
//! obtain a signer for an agent at spawn time.

use super::{SecureWallet, TransactionSigner, WalletError};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;

/// Environment variable prefix for agent keys (`AGENT_KEY_<AGENT_ID>`)
pub const AGENT_KEY_ENV_PREFIX: &str = "AGENT_KEY_";

/// Resolves the signer an agent trades with
pub trait SignerProvider: Send + Sync {
    fn signer_for(&self, agent_id: &str) -> Result<Arc<dyn TransactionSigner>, WalletError>;
}

/// Reads base58 secrets from `AGENT_KEY_<AGENT_ID>` environment variables
#[derive(Debug, Clone)]
pub struct EnvKeyring {
    prefix: String,
}

impl EnvKeyring {
    pub fn new() -> Self {
        Self {
            prefix: AGENT_KEY_ENV_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Environment variable name for an agent id (uppercased, non-alphanumerics as `_`)
    pub fn var_name(&self, agent_id: &str) -> String {
        let suffix: String = agent_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvKeyring {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerProvider for EnvKeyring {
    fn signer_for(&self, agent_id: &str) -> Result<Arc<dyn TransactionSigner>, WalletError> {
        let var = self.var_name(agent_id);
        let secret = std::env::var(&var)
            .map(SecretString::from)
            .map_err(|_| WalletError::MissingKey(agent_id.to_string()))?;
        let wallet = SecureWallet::from_base58(&secret)?;
        tracing::debug!(agent_id, address = %wallet.address_string(), "Loaded agent wallet");
        Ok(Arc::new(wallet))
    }
}

/// Fixed set of signers, keyed by agent id
#[derive(Default, Clone)]
pub struct StaticKeyring {
    signers: HashMap<String, Arc<dyn TransactionSigner>>,
}

impl StaticKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signer(
        mut self,
        agent_id: impl Into<String>,
        signer: Arc<dyn TransactionSigner>,
    ) -> Self {
        self.signers.insert(agent_id.into(), signer);
        self
    }
}

impl SignerProvider for StaticKeyring {
    fn signer_for(&self, agent_id: &str) -> Result<Arc<dyn TransactionSigner>, WalletError> {
        self.signers
            .get(agent_id)
            .cloned()
            .ok_or_else(|| WalletError::MissingKey(agent_id.to_string()))
    }
}
