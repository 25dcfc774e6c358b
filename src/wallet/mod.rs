//! Agent wallet signing
//!
//! This module handles private key storage and transaction signing.
//! Key material never leaves this module and is never logged.

mod keyring;
mod signer;

pub use keyring::{EnvKeyring, SignerProvider, StaticKeyring, AGENT_KEY_ENV_PREFIX};
pub use signer::{SecureWallet, TransactionSigner};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("No signing key configured for agent {0}")]
    MissingKey(String),
}
