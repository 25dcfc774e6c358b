//! Error types for the swap cycle engine
//!
//! Every failure coming out of the chain or swap layers carries an
//! [`ErrorClass`]. The agent cycle decides between retrying, failing and
//! reconciling purely from that class.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::ChainError;
use crate::store::StoreError;
use crate::swap::SwapError;
use crate::wallet::WalletError;

/// Classification shared by every external-call error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Service asked us to slow down; retried with backoff
    RateLimited,
    /// Timeouts, connection resets, 5xx; retried a bounded number of times
    TransientNetwork,
    /// Bad route, insufficient funds, invalid config; never retried
    Permanent,
    /// Outcome of a fund-moving call is indeterminate; must be reconciled
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::RateLimited | ErrorClass::TransientNetwork)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Swap error: {0}")]
    Swap(#[from] SwapError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Invalid phase transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cycle task error: {0}")]
    Task(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Class of the underlying failure, if it came from an external call
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Swap(e) => e.class(),
            Error::Chain(e) => e.class(),
            Error::Store(_) | Error::Io(_) => ErrorClass::TransientNetwork,
            _ => ErrorClass::Permanent,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
