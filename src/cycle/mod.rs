//! Per-agent trading cycle
//!
//! An agent repeatedly buys a fixed SOL amount of its token, holds it for the
//! sell delay, sells it back and rests:
//!
//! ```text
//! Idle -> AwaitingBuyBalance -> Buying -> HoldingAwaitingSell -> Selling -> Resting
//!              ^                                                              |
//!              +--------------------------------------------------------------+
//! ```
//!
//! Every transition is persisted through a
//! [`CycleStateStore`](crate::store::CycleStateStore) before the next phase
//! makes an external call, and announced as a [`CycleEvent`].

mod agent;
mod state_machine;

pub use agent::{AgentCycle, CycleDeps};
pub use state_machine::{transition, CycleSignal};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingBuyBalance,
    Buying,
    HoldingAwaitingSell,
    Selling,
    Resting,
    Stopped,
    Failed,
}

impl Phase {
    /// Phases in which a cycle task is (or should be) making progress
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Idle | Phase::Stopped | Phase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::AwaitingBuyBalance => "awaiting_buy_balance",
            Phase::Buying => "buying",
            Phase::HoldingAwaitingSell => "holding_awaiting_sell",
            Phase::Selling => "selling",
            Phase::Resting => "resting",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapSide {
    Buy,
    Sell,
}

impl SwapSide {
    /// Phase in which a swap of this side is executed
    pub fn phase(&self) -> Phase {
        match self {
            SwapSide::Buy => Phase::Buying,
            SwapSide::Sell => Phase::Selling,
        }
    }
}

/// A swap that may have reached the chain
///
/// Written before submission and cleared once the outcome is known. A state
/// loaded with this set is resumed by reconciling balances, never by
/// submitting again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSwap {
    pub side: SwapSide,
    pub amount_in: u64,
    /// Quote output floor (buy) used to judge a reconciled buy
    pub min_expected: u64,
    /// Token balance read just before submission
    pub baseline_token_balance: u64,
    #[serde(default)]
    pub signature: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCycleState {
    pub agent_id: String,
    pub phase: Phase,
    /// Last observed SOL balance (lamports)
    #[serde(default)]
    pub last_balance: Option<u64>,
    /// Tokens bought in the current cycle and not yet sold
    #[serde(default)]
    pub purchased_amount: u64,
    #[serde(default)]
    pub last_output_amount: Option<u64>,
    #[serde(default)]
    pub last_signature: Option<String>,
    #[serde(default)]
    pub pending_swap: Option<PendingSwap>,
    /// End of the current wait (sell delay, rest delay or failure cooldown)
    #[serde(default)]
    pub wake_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_class: Option<ErrorClass>,
    #[serde(default)]
    pub completed_cycles: u64,
}

impl AgentCycleState {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            phase: Phase::Idle,
            last_balance: None,
            purchased_amount: 0,
            last_output_amount: None,
            last_signature: None,
            pending_swap: None,
            wake_at: None,
            last_transition_at: Utc::now(),
            consecutive_failures: 0,
            last_error: None,
            last_error_class: None,
            completed_cycles: 0,
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>, class: ErrorClass) {
        self.last_error = Some(message.into());
        self.last_error_class = Some(class);
    }

    pub fn clear_error(&mut self) {
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_error_class = None;
    }
}

/// Status change emitted on every transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleEvent {
    pub id: Uuid,
    pub agent_id: String,
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub signature: Option<String>,
    pub consecutive_failures: u32,
}

impl CycleEvent {
    pub fn new(from: Phase, state: &AgentCycleState) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: state.agent_id.clone(),
            from,
            to: state.phase,
            at: state.last_transition_at,
            last_error: state.last_error.clone(),
            signature: state.last_signature.clone(),
            consecutive_failures: state.consecutive_failures,
        }
    }
}
