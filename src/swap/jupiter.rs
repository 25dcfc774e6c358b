//! Jupiter swap API
//!
//! Quotes via `GET /quote`, unsigned transactions via `POST /swap`. This
//! module only talks HTTP and classifies responses; retries live in
//! [`super::SwapClient`].

use super::{QuoteRequest, QuoteResult, SwapError, SwapService};
use crate::config::{SwapApiConfig, JUPITER_API_KEY_ENV};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Error codes Jupiter returns in 4xx bodies
mod error_codes {
    pub const NO_ROUTE: &[&str] = &[
        "COULD_NOT_FIND_ANY_ROUTE",
        "NO_ROUTES_FOUND",
        "TOKEN_NOT_TRADABLE",
        "ROUTE_PLAN_DOES_NOT_CONSUME_ALL_THE_AMOUNT",
    ];
    pub const LIQUIDITY: &[&str] = &["CIRCULAR_ARBITRAGE_IS_DISABLED", "INSUFFICIENT_LIQUIDITY"];
    pub const RATE_LIMITED: &[&str] = &["RATE_LIMITED", "TOO_MANY_REQUESTS"];
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    input_mint: String,
    output_mint: String,
    in_amount: String,
    out_amount: String,
    other_amount_threshold: String,
    #[serde(default)]
    price_impact_pct: Option<String>,
    #[serde(default)]
    route_plan: Vec<RoutePlanStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutePlanStep {
    swap_info: SwapInfo,
}

#[derive(Debug, Deserialize)]
struct SwapInfo {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_code: Option<String>,
}

/// HTTP client for the Jupiter aggregator
pub struct JupiterApi {
    http: reqwest::Client,
    quote_url: String,
    swap_url: String,
    api_key: Option<SecretString>,
    quote_validity: Duration,
}

impl JupiterApi {
    pub fn new(config: &SwapApiConfig) -> Result<Self, SwapError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SwapError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        let api_key = std::env::var(JUPITER_API_KEY_ENV).ok().map(SecretString::from);
        if api_key.is_none() {
            tracing::debug!("No {} set, using keyless Jupiter access", JUPITER_API_KEY_ENV);
        }

        Ok(Self {
            http,
            quote_url: config.quote_url.clone(),
            swap_url: config.swap_url.clone(),
            api_key,
            quote_validity: config.quote_validity(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("x-api-key", key.expose_secret()),
            None => request,
        }
    }

    /// Turn a non-2xx response into a classified error
    async fn error_from_response(response: reqwest::Response) -> SwapError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        classify_error(status, &body, retry_after)
    }
}

fn map_transport_error(e: reqwest::Error) -> SwapError {
    if e.is_timeout() {
        SwapError::Timeout
    } else {
        SwapError::Transport(e.to_string())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_error(status: StatusCode, body: &str, retry_after: Option<Duration>) -> SwapError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return SwapError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return SwapError::ServerError(status.as_u16());
    }

    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed.error.unwrap_or_else(|| body.to_string());
    match parsed.error_code.as_deref() {
        Some(code) if error_codes::RATE_LIMITED.contains(&code) => {
            SwapError::RateLimited { retry_after }
        }
        Some(code) if error_codes::NO_ROUTE.contains(&code) => SwapError::NoRoute(message),
        Some(code) if error_codes::LIQUIDITY.contains(&code) => {
            SwapError::InsufficientLiquidity(message)
        }
        _ => SwapError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

fn parse_amount(field: &str, value: &str) -> Result<u64, SwapError> {
    value
        .parse::<u64>()
        .map_err(|_| SwapError::MalformedResponse(format!("{} is not an integer: {}", field, value)))
}

/// Validate a quote body and convert it into a [`QuoteResult`]
fn parse_quote(
    raw: Value,
    slippage_bps: u16,
    validity: Duration,
) -> Result<QuoteResult, SwapError> {
    let quote: QuoteResponse = serde_json::from_value(raw.clone())
        .map_err(|e| SwapError::MalformedResponse(format!("quote: {}", e)))?;

    if quote.route_plan.is_empty() {
        return Err(SwapError::NoRoute("quote has an empty route plan".to_string()));
    }

    let price_impact_pct = match quote.price_impact_pct.as_deref() {
        Some(s) => s
            .parse::<f64>()
            .map_err(|_| SwapError::MalformedResponse(format!("priceImpactPct: {}", s)))?,
        None => 0.0,
    };

    Ok(QuoteResult {
        in_amount: parse_amount("inAmount", &quote.in_amount)?,
        out_amount: parse_amount("outAmount", &quote.out_amount)?,
        min_out_amount: parse_amount("otherAmountThreshold", &quote.other_amount_threshold)?,
        price_impact_pct,
        route_labels: quote
            .route_plan
            .into_iter()
            .filter_map(|step| step.swap_info.label)
            .collect(),
        input_mint: quote.input_mint,
        output_mint: quote.output_mint,
        slippage_bps,
        fetched_at: Utc::now(),
        expires_at: Instant::now() + validity,
        raw,
    })
}

#[async_trait]
impl SwapService for JupiterApi {
    async fn quote(&self, request: &QuoteRequest) -> Result<QuoteResult, SwapError> {
        let amount = request.amount.to_string();
        let slippage = request.slippage_bps.to_string();
        let response = self
            .authorize(self.http.get(&self.quote_url).query(&[
                ("inputMint", request.input_mint.as_str()),
                ("outputMint", request.output_mint.as_str()),
                ("amount", amount.as_str()),
                ("slippageBps", slippage.as_str()),
                ("restrictIntermediateTokens", "false"),
            ]))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| SwapError::MalformedResponse(format!("quote body: {}", e)))?;
        parse_quote(raw, request.slippage_bps, self.quote_validity)
    }

    async fn swap_transaction(
        &self,
        quote: &QuoteResult,
        user_pubkey: &str,
    ) -> Result<String, SwapError> {
        let payload = json!({
            "userPublicKey": user_pubkey,
            "quoteResponse": quote.raw,
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
        });

        let response = self
            .authorize(self.http.post(&self.swap_url).json(&payload))
            .send()
            .await
            .map_err(map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let body: SwapResponse = response
            .json()
            .await
            .map_err(|e| SwapError::MalformedResponse(format!("swap body: {}", e)))?;
        body.swap_transaction
            .filter(|tx| !tx.is_empty())
            .ok_or_else(|| SwapError::MalformedResponse("no swapTransaction in response".to_string()))
    }
}
