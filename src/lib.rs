//! Swap cycle engine
//!
//! Runs an independent buy -> hold -> sell -> rest loop per agent on Solana,
//! quoting and building swaps through the Jupiter aggregator:
//! - [`swap`]: quotes, backoff, signing and submission of swaps
//! - [`chain`]: balances and transaction confirmation over JSON-RPC
//! - [`cycle`]: the per-agent state machine
//! - [`supervisor`]: start/stop/status/reset of agent cycles
//! - [`store`]: persisted cycle state so restarts resume where they left off
//!
//! # Security Model
//!
//! - Signing keys stay inside [`wallet`] and are never logged
//! - The swap service only ever sees public keys
//! - A swap that may have been submitted is reconciled, never resubmitted

pub mod chain;
pub mod config;
pub mod cycle;
pub mod store;
pub mod supervisor;
pub mod swap;
pub mod tokens;
pub mod wallet;

mod error;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{AgentConfig, AgentConfigSource, Config, InMemoryConfigSource, RpcConfig};
pub use cycle::{AgentCycleState, CycleEvent, Phase};
pub use error::{Error, ErrorClass, Result};
pub use store::{CycleStateStore, JsonFileStateStore, MemoryStateStore};
pub use supervisor::{CycleSupervisor, StartReport};
pub use swap::{JupiterApi, SwapClient, SwapOutcome, Swapper};
