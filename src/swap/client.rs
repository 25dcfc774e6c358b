//! Retrying swap client
//!
//! Wraps a [`SwapService`] with backoff and validation, then signs and submits
//! the resulting transaction through a [`ChainClient`].

use super::{
    sign_wire_transaction, BackoffPolicy, QuoteRequest, QuoteResult, SwapError, SwapOutcome,
    SwapService, Swapper,
};
use crate::chain::{ChainClient, Confirmation};
use crate::config::{CycleTiming, SwapApiConfig};
use crate::error::ErrorClass;
use crate::tokens;
use crate::wallet::TransactionSigner;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use std::sync::Arc;
use std::time::Duration;

pub struct SwapClient {
    service: Arc<dyn SwapService>,
    chain: Arc<dyn ChainClient>,
    backoff: BackoffPolicy,
    confirm_timeout: Duration,
    confirm_poll: Duration,
}

impl SwapClient {
    pub fn new(
        service: Arc<dyn SwapService>,
        chain: Arc<dyn ChainClient>,
        backoff: BackoffPolicy,
        confirm_timeout: Duration,
        confirm_poll: Duration,
    ) -> Self {
        Self {
            service,
            chain,
            backoff,
            confirm_timeout,
            confirm_poll,
        }
    }

    pub fn from_config(
        service: Arc<dyn SwapService>,
        chain: Arc<dyn ChainClient>,
        swap: &SwapApiConfig,
        timing: &CycleTiming,
    ) -> Self {
        Self::new(
            service,
            chain,
            BackoffPolicy::from(&swap.backoff),
            timing.confirm_timeout(),
            timing.confirm_poll(),
        )
    }

    fn validate_request(request: &QuoteRequest) -> Result<(), SwapError> {
        if request.amount == 0 {
            return Err(SwapError::InvalidRequest("amount must be positive".to_string()));
        }
        if request.input_mint == request.output_mint {
            return Err(SwapError::InvalidRequest(
                "input and output mints are identical".to_string(),
            ));
        }
        for mint in [&request.input_mint, &request.output_mint] {
            if !tokens::is_valid_address(mint) {
                return Err(SwapError::InvalidRequest(format!("invalid mint {}", mint)));
            }
        }
        if request.slippage_bps > 10_000 {
            return Err(SwapError::InvalidRequest(format!(
                "slippage {} bps exceeds 100%",
                request.slippage_bps
            )));
        }
        Ok(())
    }

    fn validate_quote(request: &QuoteRequest, quote: &QuoteResult) -> Result<(), SwapError> {
        if quote.input_mint != request.input_mint || quote.output_mint != request.output_mint {
            return Err(SwapError::MalformedResponse(format!(
                "quote is for {} -> {}, requested {} -> {}",
                quote.input_mint, quote.output_mint, request.input_mint, request.output_mint
            )));
        }
        if quote.in_amount != request.amount {
            return Err(SwapError::MalformedResponse(format!(
                "quote input {} differs from requested {}",
                quote.in_amount, request.amount
            )));
        }
        if quote.out_amount == 0 {
            return Err(SwapError::InsufficientLiquidity(
                "quote output is zero".to_string(),
            ));
        }
        if quote.min_out_amount > quote.out_amount {
            return Err(SwapError::MalformedResponse(
                "minimum output exceeds expected output".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Swapper for SwapClient {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResult, SwapError> {
        let request = QuoteRequest {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            amount,
            slippage_bps,
        };
        Self::validate_request(&request)?;

        let quote = self
            .backoff
            .retry("quote", |_| self.service.quote(&request))
            .await?;
        Self::validate_quote(&request, &quote)?;

        tracing::debug!(
            input = %tokens::display_symbol(input_mint),
            output = %tokens::display_symbol(output_mint),
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            min_out = quote.min_out_amount,
            price_impact_pct = quote.price_impact_pct,
            route = ?quote.route_labels,
            "Received quote"
        );
        Ok(quote)
    }

    async fn execute_swap(
        &self,
        quote: &QuoteResult,
        signer: &dyn TransactionSigner,
    ) -> SwapOutcome {
        if quote.is_expired() {
            return SwapOutcome::Failed {
                error: SwapError::QuoteExpired,
            };
        }

        let user = signer.address();
        let encoded = match self
            .backoff
            .retry("swap_transaction", |_| self.service.swap_transaction(quote, &user))
            .await
        {
            Ok(tx) => tx,
            Err(error) => return SwapOutcome::Failed { error },
        };

        let wire = match BASE64.decode(encoded.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                return SwapOutcome::Failed {
                    error: SwapError::MalformedResponse(format!("swapTransaction base64: {}", e)),
                }
            }
        };

        let signed = match sign_wire_transaction(&wire, signer) {
            Ok(signed) => signed,
            Err(error) => return SwapOutcome::Failed { error },
        };

        tracing::info!(
            signature = %signed.signature,
            in_amount = quote.in_amount,
            expected_out = quote.out_amount,
            "Submitting swap"
        );

        match self
            .chain
            .submit_and_confirm(&signed.bytes, self.confirm_timeout, self.confirm_poll)
            .await
        {
            Ok(Confirmation::Confirmed { signature, slot }) => {
                tracing::info!(%signature, slot, "Swap confirmed");
                SwapOutcome::Success {
                    signature,
                    output_amount: quote.out_amount,
                }
            }
            Ok(Confirmation::Failed { signature, reason }) => {
                tracing::warn!(%signature, %reason, "Swap failed on chain");
                SwapOutcome::Failed {
                    error: SwapError::TransactionFailed { signature, reason },
                }
            }
            Ok(Confirmation::TimedOut { signature }) => {
                tracing::warn!(%signature, "Swap confirmation timed out, outcome unknown");
                SwapOutcome::Unknown { signature }
            }
            Err(e) if e.class() == ErrorClass::Permanent => {
                tracing::warn!(error = %e, "Swap submission rejected");
                SwapOutcome::Failed {
                    error: SwapError::Chain(e),
                }
            }
            Err(e) => {
                // The node may have forwarded the transaction before the error
                tracing::warn!(
                    signature = %signed.signature,
                    error = %e,
                    "Swap submission interrupted, outcome unknown"
                );
                SwapOutcome::Unknown {
                    signature: signed.signature,
                }
            }
        }
    }
}
