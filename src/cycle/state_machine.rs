use super::{AgentCycleState, Phase, SwapSide};
use crate::{Error, Result};

/// Inputs that move an agent between phases
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleSignal {
    /// Cycle (re)started with nothing in flight
    Start { holding: bool },
    /// Cycle restarted with a possibly submitted swap to reconcile
    ResumePending { side: SwapSide },
    FundsAvailable,
    Bought { sell_enabled: bool },
    BuyFailed { exhausted: bool },
    SellDue,
    Sold,
    SellFailed { exhausted: bool },
    RestElapsed,
    Stop,
    Fault,
    Reset,
}

pub fn transition(current: &AgentCycleState, signal: &CycleSignal) -> Result<Phase> {
    let phase = current.phase;
    match (phase, signal) {
        (Phase::Idle | Phase::Stopped, CycleSignal::Start { holding: true }) => {
            Ok(Phase::HoldingAwaitingSell)
        }
        (Phase::Idle | Phase::Stopped, CycleSignal::Start { holding: false }) => {
            Ok(Phase::AwaitingBuyBalance)
        }
        // Interrupted after entering the swap phase but before submission
        (Phase::Buying, CycleSignal::Start { holding: false }) => Ok(Phase::AwaitingBuyBalance),
        (Phase::Selling, CycleSignal::Start { holding: true }) => Ok(Phase::HoldingAwaitingSell),
        (Phase::Idle | Phase::Stopped, CycleSignal::ResumePending { side }) => Ok(side.phase()),

        (Phase::AwaitingBuyBalance, CycleSignal::FundsAvailable) => Ok(Phase::Buying),
        (Phase::Buying, CycleSignal::Bought { sell_enabled: true }) => {
            Ok(Phase::HoldingAwaitingSell)
        }
        (Phase::Buying, CycleSignal::Bought { sell_enabled: false }) => Ok(Phase::Resting),
        (Phase::Buying, CycleSignal::BuyFailed { exhausted: false }) => {
            Ok(Phase::AwaitingBuyBalance)
        }
        (Phase::Buying, CycleSignal::BuyFailed { exhausted: true }) => Ok(Phase::Failed),
        (Phase::HoldingAwaitingSell, CycleSignal::SellDue) if current.purchased_amount > 0 => {
            Ok(Phase::Selling)
        }
        (Phase::Selling, CycleSignal::Sold) => Ok(Phase::Resting),
        (Phase::Selling, CycleSignal::SellFailed { exhausted: false }) => {
            Ok(Phase::HoldingAwaitingSell)
        }
        (Phase::Selling, CycleSignal::SellFailed { exhausted: true }) => Ok(Phase::Failed),
        (Phase::Resting, CycleSignal::RestElapsed) => Ok(Phase::AwaitingBuyBalance),

        (Phase::Failed, CycleSignal::Stop) => Ok(Phase::Failed),
        (_, CycleSignal::Stop) => Ok(Phase::Stopped),
        (_, CycleSignal::Fault) => Ok(Phase::Failed),
        (Phase::Failed | Phase::Stopped | Phase::Idle, CycleSignal::Reset) => Ok(Phase::Idle),

        _ => Err(Error::InvalidTransition(format!(
            "{} cannot handle {:?} (agent {}, purchased {})",
            phase, signal, current.agent_id, current.purchased_amount
        ))),
    }
}
