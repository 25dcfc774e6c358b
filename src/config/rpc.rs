//! RPC endpoint configuration
//!
//! Resolution order when no URL is given in the config file:
//! 1. `SOLANA_RPC_URL` - highest priority
//! 2. `HELIUS_API_KEY` - builds the Helius mainnet URL
//! 3. Public mainnet RPC - heavily rate limited, for testing only
//!
//! ```bash
//! export SOLANA_RPC_URL="https://mainnet.helius-rpc.com/?api-key=YOUR_KEY"
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable names
mod env_vars {
    pub const SOLANA_RPC_URL: &str = "SOLANA_RPC_URL";
    pub const HELIUS_API_KEY: &str = "HELIUS_API_KEY";
}

/// Public mainnet endpoint (rate limited, for testing only)
pub const PUBLIC_MAINNET_RPC: &str = "https://api.mainnet-beta.solana.com";

fn default_url() -> String {
    RpcConfig::resolve_url_from_env()
}

fn default_commitment() -> String {
    "confirmed".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

/// Solana RPC settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Commitment used for reads and confirmation ("processed", "confirmed", "finalized")
    #[serde(default = "default_commitment")]
    pub commitment: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Retries for transient failures, on top of the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl RpcConfig {
    /// Create RPC config from environment variables
    pub fn from_env() -> Self {
        Self::with_url(Self::resolve_url_from_env())
    }

    /// Create with an explicit RPC URL
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            commitment: default_commitment(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn resolve_url_from_env() -> String {
        if let Ok(url) = std::env::var(env_vars::SOLANA_RPC_URL) {
            tracing::debug!("Using SOLANA_RPC_URL");
            return url;
        }
        if let Ok(key) = std::env::var(env_vars::HELIUS_API_KEY) {
            tracing::info!("Building RPC URL from HELIUS_API_KEY");
            return format!("https://mainnet.helius-rpc.com/?api-key={}", key);
        }
        tracing::warn!("No RPC configured, using public mainnet RPC (rate limited)");
        PUBLIC_MAINNET_RPC.to_string()
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_locked_env;

    #[test]
    fn test_env_url_takes_priority() {
        with_locked_env(
            &[
                (env_vars::SOLANA_RPC_URL, Some("https://custom.rpc")),
                (env_vars::HELIUS_API_KEY, Some("abc")),
            ],
            || {
                assert_eq!(RpcConfig::from_env().url, "https://custom.rpc");
            },
        );
    }

    #[test]
    fn test_helius_key_builds_url() {
        with_locked_env(
            &[
                (env_vars::SOLANA_RPC_URL, None),
                (env_vars::HELIUS_API_KEY, Some("abc")),
            ],
            || {
                assert_eq!(
                    RpcConfig::from_env().url,
                    "https://mainnet.helius-rpc.com/?api-key=abc"
                );
            },
        );
    }

    #[test]
    fn test_public_rpc_fallback() {
        with_locked_env(
            &[
                (env_vars::SOLANA_RPC_URL, None),
                (env_vars::HELIUS_API_KEY, None),
            ],
            || {
                let config = RpcConfig::from_env();
                assert_eq!(config.url, PUBLIC_MAINNET_RPC);
                assert_eq!(config.commitment, "confirmed");
            },
        );
    }
}
