//! Ledger access
//!
//! Balance queries and transaction submission/confirmation against Solana.
//! The cycle depends only on the [`ChainClient`] trait; [`SolanaRpcClient`] is
//! the JSON-RPC implementation.

mod rpc;

pub use rpc::SolanaRpcClient;

use crate::error::ErrorClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("RPC request timed out")]
    Timeout,

    #[error("RPC rate limited")]
    RateLimited,

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Malformed RPC response: {0}")]
    Malformed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Node-side conditions that clear up on their own
const TRANSIENT_RPC_CODES: &[i64] = &[
    -32004, // block not available for slot
    -32005, // node is unhealthy / behind
    -32014, // block status not yet available
    -32016, // minimum context slot not reached
];

impl ChainError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ChainError::Transport(_) | ChainError::Timeout => ErrorClass::TransientNetwork,
            ChainError::RateLimited => ErrorClass::RateLimited,
            ChainError::Rpc { code, .. } if TRANSIENT_RPC_CODES.contains(code) => {
                ErrorClass::TransientNetwork
            }
            ChainError::Rpc { .. } | ChainError::Malformed(_) | ChainError::InvalidAddress(_) => {
                ErrorClass::Permanent
            }
        }
    }
}

/// Status of a submitted transaction as seen by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
    /// Not seen yet, or seen below the requested commitment
    Pending,
    Confirmed { slot: u64 },
    Failed { slot: u64, reason: String },
}

/// Result of [`ChainClient::submit_and_confirm`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Confirmation {
    Confirmed { signature: String, slot: u64 },
    Failed { signature: String, reason: String },
    /// Still pending when the deadline passed; outcome unknown
    TimedOut { signature: String },
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Native balance in lamports
    async fn get_balance(&self, address: &str) -> Result<u64, ChainError>;

    /// Sum of the owner's token accounts for `mint`, in raw base units
    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainError>;

    /// Submit a fully signed wire transaction, returning its signature
    async fn send_transaction(&self, signed_tx: &[u8]) -> Result<String, ChainError>;

    async fn signature_status(&self, signature: &str) -> Result<SignatureStatus, ChainError>;

    /// Submit and poll for confirmation until `timeout` elapses.
    ///
    /// Errors only when submission itself fails. Once submitted, status poll
    /// errors are logged and polling continues; the deadline yields
    /// [`Confirmation::TimedOut`].
    async fn submit_and_confirm(
        &self,
        signed_tx: &[u8],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Confirmation, ChainError> {
        let signature = self.send_transaction(signed_tx).await?;
        let deadline = Instant::now() + timeout;
        let mut polls = 0u32;

        loop {
            polls += 1;
            match self.signature_status(&signature).await {
                Ok(SignatureStatus::Confirmed { slot }) => {
                    tracing::debug!(%signature, slot, polls, "Transaction confirmed");
                    return Ok(Confirmation::Confirmed { signature, slot });
                }
                Ok(SignatureStatus::Failed { reason, .. }) => {
                    return Ok(Confirmation::Failed { signature, reason });
                }
                Ok(SignatureStatus::Pending) => {}
                Err(e) => {
                    tracing::warn!(%signature, poll = polls, error = %e, "Signature status poll failed");
                }
            }

            if Instant::now() + poll_interval > deadline {
                tracing::warn!(%signature, polls, "Confirmation deadline reached");
                return Ok(Confirmation::TimedOut { signature });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChain;

    #[test]
    fn test_error_classification() {
        assert_eq!(ChainError::Timeout.class(), ErrorClass::TransientNetwork);
        assert_eq!(ChainError::RateLimited.class(), ErrorClass::RateLimited);
        assert_eq!(
            ChainError::Rpc {
                code: -32005,
                message: "Node is behind".to_string()
            }
            .class(),
            ErrorClass::TransientNetwork
        );
        assert_eq!(
            ChainError::Rpc {
                code: -32602,
                message: "Invalid params".to_string()
            }
            .class(),
            ErrorClass::Permanent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_confirm_confirms() {
        let chain = MockChain::new();
        chain.set_status_sequence(vec![
            SignatureStatus::Pending,
            SignatureStatus::Confirmed { slot: 42 },
        ]);

        let confirmation = chain
            .submit_and_confirm(b"tx", Duration::from_secs(30), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(matches!(confirmation, Confirmation::Confirmed { slot: 42, .. }));
        assert_eq!(chain.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_and_confirm_times_out() {
        let chain = MockChain::new();
        chain.set_status_sequence(vec![SignatureStatus::Pending]);

        let started = Instant::now();
        let confirmation = chain
            .submit_and_confirm(b"tx", Duration::from_secs(10), Duration::from_secs(2))
            .await
            .unwrap();

        assert!(matches!(confirmation, Confirmation::TimedOut { .. }));
        assert!(started.elapsed() <= Duration::from_secs(10));
    }
}
