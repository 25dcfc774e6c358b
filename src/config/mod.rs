//! Configuration for the swap cycle engine

pub mod rpc;
mod source;

use crate::tokens::{self, MIN_BUY_LAMPORTS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use rpc::RpcConfig;
pub use source::{AgentConfigSource, InMemoryConfigSource};

/// Jupiter API key environment variable name
pub const JUPITER_API_KEY_ENV: &str = "JUPITER_API_KEY";

/// Default slippage tolerance (20%), matching what the bot has always traded with
pub const DEFAULT_SLIPPAGE_BPS: u16 = 2_000;

const MAX_SLIPPAGE_BPS: u16 = 10_000;

fn default_true() -> bool {
    true
}

fn default_slippage_bps() -> u16 {
    DEFAULT_SLIPPAGE_BPS
}

fn default_retry_limit() -> u32 {
    3
}

/// Per-agent trading settings
///
/// A cycle takes a snapshot of this at the start of every iteration; edits made
/// through an [`AgentConfigSource`] land at the next iteration, never mid-swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    /// Owning user (chat id in the bot front-end)
    pub owner: String,
    /// Mint of the token being traded against SOL
    pub token_mint: String,
    /// Fixed SOL amount spent per buy, in lamports
    pub buy_amount_lamports: u64,
    #[serde(default = "default_true")]
    pub sell_enabled: bool,
    #[serde(default)]
    pub sell_delay_secs: u64,
    #[serde(default)]
    pub rest_delay_secs: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    /// Sell-side slippage; falls back to `slippage_bps`
    #[serde(default)]
    pub sell_slippage_bps: Option<u16>,
    /// Consecutive failed buys before the agent is marked failed
    #[serde(default = "default_retry_limit")]
    pub buy_retry_limit: u32,
    /// Consecutive failed sells before the agent is marked failed
    #[serde(default = "default_retry_limit")]
    pub sell_retry_limit: u32,
}

impl AgentConfig {
    pub fn new(
        agent_id: impl Into<String>,
        owner: impl Into<String>,
        token_mint: impl Into<String>,
        buy_amount_lamports: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            owner: owner.into(),
            token_mint: token_mint.into(),
            buy_amount_lamports,
            sell_enabled: true,
            sell_delay_secs: 0,
            rest_delay_secs: 0,
            slippage_bps: DEFAULT_SLIPPAGE_BPS,
            sell_slippage_bps: None,
            buy_retry_limit: default_retry_limit(),
            sell_retry_limit: default_retry_limit(),
        }
    }

    pub fn sell_delay(&self) -> Duration {
        Duration::from_secs(self.sell_delay_secs)
    }

    /// Rest between cycles; never shorter than one second
    pub fn rest_delay(&self) -> Duration {
        Duration::from_secs(self.rest_delay_secs.max(1))
    }

    pub fn sell_slippage(&self) -> u16 {
        self.sell_slippage_bps.unwrap_or(self.slippage_bps)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(Error::Config("agent_id must not be empty".to_string()));
        }
        if !self
            .agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "agent_id {:?} may only contain letters, digits, '-' and '_'",
                self.agent_id
            )));
        }
        if !tokens::is_valid_address(&self.token_mint) {
            return Err(Error::Config(format!(
                "agent {}: invalid token mint {}",
                self.agent_id, self.token_mint
            )));
        }
        if self.token_mint == tokens::mints::WSOL {
            return Err(Error::Config(format!(
                "agent {}: cannot trade SOL against itself",
                self.agent_id
            )));
        }
        if self.buy_amount_lamports < MIN_BUY_LAMPORTS {
            return Err(Error::Config(format!(
                "agent {}: buy amount {} lamports is below the minimum of {}",
                self.agent_id, self.buy_amount_lamports, MIN_BUY_LAMPORTS
            )));
        }
        if self.slippage_bps > MAX_SLIPPAGE_BPS || self.sell_slippage() > MAX_SLIPPAGE_BPS {
            return Err(Error::Config(format!(
                "agent {}: slippage above {} bps",
                self.agent_id, MAX_SLIPPAGE_BPS
            )));
        }
        if self.buy_retry_limit == 0 || self.sell_retry_limit == 0 {
            return Err(Error::Config(format!(
                "agent {}: retry limits must be at least 1",
                self.agent_id
            )));
        }
        Ok(())
    }
}

/// Backoff applied to rate-limited and transient swap API calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry (milliseconds)
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Randomize each delay within its exponential band
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter: true,
        }
    }
}

/// Jupiter swap API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapApiConfig {
    pub quote_url: String,
    pub swap_url: String,
    /// Per-request timeout (seconds)
    pub request_timeout_secs: u64,
    /// How long a quote may be used to build a swap (seconds)
    pub quote_validity_secs: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl SwapApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn quote_validity(&self) -> Duration {
        Duration::from_secs(self.quote_validity_secs)
    }
}

impl Default for SwapApiConfig {
    fn default() -> Self {
        Self {
            quote_url: "https://api.jup.ag/swap/v1/quote".to_string(),
            swap_url: "https://api.jup.ag/swap/v1/swap".to_string(),
            request_timeout_secs: 10,
            quote_validity_secs: 30,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Engine-wide cycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleTiming {
    /// Interval between balance checks while waiting for funds (seconds)
    pub balance_poll_secs: u64,
    /// SOL kept aside for network fees on top of the buy amount (lamports)
    pub fee_reserve_lamports: u64,
    /// Wait after a failed swap attempt before trying again (seconds)
    pub failure_cooldown_secs: u64,
    /// Maximum wait for a submitted swap to confirm (seconds)
    pub confirm_timeout_secs: u64,
    /// Interval between confirmation polls (milliseconds)
    pub confirm_poll_ms: u64,
    /// Wait before reading balances to reconcile an unknown outcome (seconds)
    pub reconcile_settle_secs: u64,
    /// Delay between agent starts when starting all agents of an owner (milliseconds)
    pub start_stagger_ms: u64,
}

impl CycleTiming {
    pub fn balance_poll(&self) -> Duration {
        Duration::from_secs(self.balance_poll_secs.max(1))
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_ms.max(1))
    }

    pub fn reconcile_settle(&self) -> Duration {
        Duration::from_secs(self.reconcile_settle_secs)
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }
}

impl Default for CycleTiming {
    fn default() -> Self {
        Self {
            balance_poll_secs: 5,
            fee_reserve_lamports: 10_000_000,
            failure_cooldown_secs: 5,
            confirm_timeout_secs: 60,
            confirm_poll_ms: 2_000,
            reconcile_settle_secs: 5,
            start_stagger_ms: 1_000,
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub swap: SwapApiConfig,
    #[serde(default)]
    pub cycle: CycleTiming,
    /// Directory holding one persisted cycle state file per agent
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

impl Config {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            agent.validate()?;
            if !seen.insert(agent.agent_id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate agent id {}",
                    agent.agent_id
                )));
            }
        }
        if self.swap.backoff.max_attempts == 0 {
            return Err(Error::Config(
                "swap.backoff.max_attempts must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.swap.quote_url)
            .map_err(|e| Error::Config(format!("swap.quote_url: {}", e)))?;
        url::Url::parse(&self.swap.swap_url)
            .map_err(|e| Error::Config(format!("swap.swap_url: {}", e)))?;
        url::Url::parse(&self.rpc.url).map_err(|e| Error::Config(format!("rpc.url: {}", e)))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            swap: SwapApiConfig::default(),
            cycle: CycleTiming::default(),
            state_dir: default_state_dir(),
            agents: Vec::new(),
        }
    }
}
