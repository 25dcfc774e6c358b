//! Solana JSON-RPC client
//!
//! Thin wrapper over the node's HTTP JSON-RPC interface. Each call is retried
//! at most `max_retries` times, and only for transient failures.

use super::{ChainClient, ChainError, SignatureStatus};
use crate::config::RpcConfig;
use crate::tokens;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    account: TokenAccountData,
}

#[derive(Debug, Deserialize)]
struct TokenAccountData {
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEntry {
    slot: u64,
    err: Option<Value>,
    confirmation_status: Option<String>,
}

/// JSON-RPC implementation of [`ChainClient`]
pub struct SolanaRpcClient {
    http: reqwest::Client,
    url: String,
    commitment: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl SolanaRpcClient {
    pub fn new(config: &RpcConfig) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ChainError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url: config.url.clone(),
            commitment: config.commitment.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }

    /// Issue one JSON-RPC call, retrying transient failures
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.call_once(method, &params).await {
                Ok(value) => return Ok(value),
                Err(e) if e.class().is_retryable() && attempt <= self.max_retries => {
                    tracing::warn!(
                        method,
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "RPC call failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<T, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ChainError::Transport(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ChainError::Rpc {
                code: i64::from(status.as_u16()),
                message: format!("HTTP {}", status),
            });
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("{}: {}", method, e)))?;

        if let Some(err) = parsed.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        parsed
            .result
            .ok_or_else(|| ChainError::Malformed(format!("{}: missing result", method)))
    }
}

fn map_transport_error(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else {
        ChainError::Transport(e.to_string())
    }
}

fn require_address(address: &str) -> Result<(), ChainError> {
    if tokens::is_valid_address(address) {
        Ok(())
    } else {
        Err(ChainError::InvalidAddress(address.to_string()))
    }
}

/// Raw amount of one jsonParsed token account
fn parsed_token_amount(data: &Value) -> Result<u64, ChainError> {
    data.pointer("/parsed/info/tokenAmount/amount")
        .and_then(Value::as_str)
        .ok_or_else(|| ChainError::Malformed("token account without tokenAmount".to_string()))?
        .parse::<u64>()
        .map_err(|e| ChainError::Malformed(format!("token amount: {}", e)))
}

fn status_from_entry(entry: Option<StatusEntry>, commitment: &str) -> SignatureStatus {
    let Some(entry) = entry else {
        return SignatureStatus::Pending;
    };
    if let Some(err) = entry.err {
        return SignatureStatus::Failed {
            slot: entry.slot,
            reason: err.to_string(),
        };
    }
    let reached = match (entry.confirmation_status.as_deref(), commitment) {
        (Some("finalized"), _) => true,
        (Some("confirmed"), "confirmed" | "processed") => true,
        (Some("processed"), "processed") => true,
        _ => false,
    };
    if reached {
        SignatureStatus::Confirmed { slot: entry.slot }
    } else {
        SignatureStatus::Pending
    }
}

#[async_trait]
impl ChainClient for SolanaRpcClient {
    async fn get_balance(&self, address: &str) -> Result<u64, ChainError> {
        require_address(address)?;
        let result: WithContext<u64> = self
            .call(
                "getBalance",
                json!([address, { "commitment": self.commitment }]),
            )
            .await?;
        Ok(result.value)
    }

    async fn get_token_balance(&self, owner: &str, mint: &str) -> Result<u64, ChainError> {
        require_address(owner)?;
        require_address(mint)?;
        let result: WithContext<Vec<TokenAccount>> = self
            .call(
                "getTokenAccountsByOwner",
                json!([
                    owner,
                    { "mint": mint },
                    { "encoding": "jsonParsed", "commitment": self.commitment }
                ]),
            )
            .await?;

        result
            .value
            .iter()
            .try_fold(0u64, |total, account| {
                parsed_token_amount(&account.account.data).map(|amount| total.saturating_add(amount))
            })
    }

    async fn send_transaction(&self, signed_tx: &[u8]) -> Result<String, ChainError> {
        // Resending identical signed bytes cannot double-spend: the signature is the tx id
        self.call(
            "sendTransaction",
            json!([
                BASE64.encode(signed_tx),
                { "encoding": "base64", "skipPreflight": true, "maxRetries": 0 }
            ]),
        )
        .await
    }

    async fn signature_status(&self, signature: &str) -> Result<SignatureStatus, ChainError> {
        let result: WithContext<Vec<Option<StatusEntry>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await?;
        let entry = result.value.into_iter().next().flatten();
        Ok(status_from_entry(entry, &self.commitment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_token_amount() {
        let data = json!({
            "parsed": {
                "info": {
                    "tokenAmount": { "amount": "1000", "decimals": 6, "uiAmount": 0.001 }
                }
            }
        });
        assert_eq!(parsed_token_amount(&data).unwrap(), 1000);
        assert!(parsed_token_amount(&json!({})).is_err());
    }

    #[test]
    fn test_status_from_entry() {
        assert_eq!(status_from_entry(None, "confirmed"), SignatureStatus::Pending);

        let processed = StatusEntry {
            slot: 5,
            err: None,
            confirmation_status: Some("processed".to_string()),
        };
        assert_eq!(
            status_from_entry(Some(processed), "confirmed"),
            SignatureStatus::Pending
        );

        let confirmed = StatusEntry {
            slot: 6,
            err: None,
            confirmation_status: Some("confirmed".to_string()),
        };
        assert_eq!(
            status_from_entry(Some(confirmed), "confirmed"),
            SignatureStatus::Confirmed { slot: 6 }
        );

        let failed = StatusEntry {
            slot: 7,
            err: Some(json!({ "InstructionError": [2, { "Custom": 6001 }] })),
            confirmation_status: Some("confirmed".to_string()),
        };
        assert!(matches!(
            status_from_entry(Some(failed), "confirmed"),
            SignatureStatus::Failed { slot: 7, .. }
        ));
    }

    #[test]
    fn test_rpc_response_with_error() {
        let body = r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"Invalid param"},"id":1}"#;
        let parsed: RpcResponse<u64> = serde_json::from_str(body).unwrap();
        assert!(parsed.result.is_none());
        assert_eq!(parsed.error.unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_rejects_invalid_address_before_network() {
        let client = SolanaRpcClient::new(&RpcConfig::with_url("http://127.0.0.1:1")).unwrap();
        let err = client.get_balance("nope").await.unwrap_err();
        assert!(matches!(err, ChainError::InvalidAddress(_)));
    }
}
