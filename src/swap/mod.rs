//! Swap quoting and execution
//!
//! - [`SwapService`] is the raw external quote/swap API (Jupiter in production)
//! - [`SwapClient`] wraps a service with backoff, response validation, signing,
//!   submission and bounded confirmation
//! - [`Swapper`] is the contract the agent cycle depends on
//!
//! SECURITY NOTE:
//! - The service only ever sees the public key
//! - Signing happens through the caller-supplied [`TransactionSigner`]

mod backoff;
mod client;
mod jupiter;
mod transaction;

pub use backoff::BackoffPolicy;
pub use client::SwapClient;
pub use jupiter::JupiterApi;
pub use transaction::{sign_wire_transaction, SignedTransaction};

use crate::chain::ChainError;
use crate::error::ErrorClass;
use crate::wallet::TransactionSigner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone)]
pub enum SwapError {
    #[error("Rate limited by swap service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Swap service transport error: {0}")]
    Transport(String),

    #[error("Swap service request timed out")]
    Timeout,

    #[error("Swap service unavailable (HTTP {0})")]
    ServerError(u16),

    #[error("No route: {0}")]
    NoRoute(String),

    #[error("Insufficient liquidity: {0}")]
    InsufficientLiquidity(String),

    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed swap service response: {0}")]
    MalformedResponse(String),

    #[error("Invalid swap request: {0}")]
    InvalidRequest(String),

    #[error("Quote expired before execution")]
    QuoteExpired,

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Transaction {signature} failed on chain: {reason}")]
    TransactionFailed { signature: String, reason: String },

    #[error("Submission failed: {0}")]
    Chain(ChainError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SwapError> },
}

impl SwapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SwapError::RateLimited { .. } => ErrorClass::RateLimited,
            SwapError::Transport(_) | SwapError::Timeout | SwapError::ServerError(_) => {
                ErrorClass::TransientNetwork
            }
            SwapError::Chain(e) => e.class(),
            SwapError::RetriesExhausted { last, .. } => last.class(),
            SwapError::NoRoute(_)
            | SwapError::InsufficientLiquidity(_)
            | SwapError::Rejected { .. }
            | SwapError::MalformedResponse(_)
            | SwapError::InvalidRequest(_)
            | SwapError::QuoteExpired
            | SwapError::Signing(_)
            | SwapError::TransactionFailed { .. } => ErrorClass::Permanent,
        }
    }
}

/// Parameters of a quote request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    /// Exact input amount in the input token's base units
    pub amount: u64,
    pub slippage_bps: u16,
}

/// A priced route, valid for a short window
///
/// Produced and consumed within a single buy or sell attempt; never cached.
#[derive(Debug, Clone)]
pub struct QuoteResult {
    pub input_mint: String,
    pub output_mint: String,
    pub in_amount: u64,
    /// Expected output
    pub out_amount: u64,
    /// Output floor after slippage
    pub min_out_amount: u64,
    pub price_impact_pct: f64,
    pub route_labels: Vec<String>,
    pub slippage_bps: u16,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: Instant,
    /// Service payload needed to build the swap transaction
    pub raw: Value,
}

impl QuoteResult {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// How a swap attempt ended
#[derive(Debug, Clone)]
pub enum SwapOutcome {
    /// Confirmed on chain. `output_amount` is the quoted output; the fill can
    /// land anywhere down to the quote's minimum, so callers that hold the
    /// output measure it from balances.
    Success {
        signature: String,
        output_amount: u64,
    },
    /// Definitely did not move funds
    Failed { error: SwapError },
    /// Submitted but neither confirmed nor rejected; must be reconciled
    Unknown { signature: String },
}

impl SwapOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SwapOutcome::Success { .. })
    }

    pub fn signature(&self) -> Option<&str> {
        match self {
            SwapOutcome::Success { signature, .. } | SwapOutcome::Unknown { signature } => {
                Some(signature)
            }
            SwapOutcome::Failed { error } => match error {
                SwapError::TransactionFailed { signature, .. } => Some(signature),
                _ => None,
            },
        }
    }

    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            SwapOutcome::Success { .. } => None,
            SwapOutcome::Failed { error } => Some(error.class()),
            SwapOutcome::Unknown { .. } => Some(ErrorClass::Unknown),
        }
    }
}

/// Raw external quote/swap API
#[async_trait]
pub trait SwapService: Send + Sync {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteResult, SwapError>;

    /// Unsigned swap transaction for `quote`, base64-encoded
    async fn swap_transaction(
        &self,
        quote: &QuoteResult,
        user_pubkey: &str,
    ) -> Result<String, SwapError>;
}

/// Quote and execute swaps on behalf of an agent
#[async_trait]
pub trait Swapper: Send + Sync {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResult, SwapError>;

    /// Never returns an error: every ending is expressed as a [`SwapOutcome`]
    async fn execute_swap(
        &self,
        quote: &QuoteResult,
        signer: &dyn TransactionSigner,
    ) -> SwapOutcome;
}
