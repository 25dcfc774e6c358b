//! The per-agent cycle task
//!
//! Waits, balance polls and quote fetches race the agent's
//! [`CancellationToken`]; swap execution does not. A stop requested while a
//! swap is in flight takes effect once its outcome is recorded.

use super::{
    transition, AgentCycleState, CycleEvent, CycleSignal, PendingSwap, Phase, SwapSide,
};
use crate::chain::ChainClient;
use crate::config::{AgentConfig, AgentConfigSource, CycleTiming};
use crate::error::ErrorClass;
use crate::store::CycleStateStore;
use crate::swap::{QuoteResult, SwapOutcome, Swapper};
use crate::tokens::{self, mints};
use crate::wallet::TransactionSigner;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Collaborators shared by every agent cycle
#[derive(Clone)]
pub struct CycleDeps {
    pub swapper: Arc<dyn Swapper>,
    pub chain: Arc<dyn ChainClient>,
    pub store: Arc<dyn CycleStateStore>,
    pub configs: Arc<dyn AgentConfigSource>,
    pub timing: CycleTiming,
    pub events: mpsc::UnboundedSender<CycleEvent>,
}

impl CycleDeps {
    /// Persist `state` and announce the transition out of `from`
    pub async fn commit(&self, from: Phase, state: &AgentCycleState) -> Result<()> {
        self.store.save(&state.agent_id, state).await?;
        if self.events.send(CycleEvent::new(from, state)).is_err() {
            tracing::trace!(agent_id = %state.agent_id, "No cycle event listener");
        }
        Ok(())
    }
}

/// How a phase step ended
enum Step {
    Advanced,
    Cancelled,
}

pub struct AgentCycle {
    deps: CycleDeps,
    signer: Arc<dyn TransactionSigner>,
    config: AgentConfig,
    state: AgentCycleState,
    cancel: CancellationToken,
    status: watch::Sender<AgentCycleState>,
}

impl AgentCycle {
    pub fn new(
        deps: CycleDeps,
        signer: Arc<dyn TransactionSigner>,
        config: AgentConfig,
        state: AgentCycleState,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<AgentCycleState>) {
        let (status, receiver) = watch::channel(state.clone());
        let cycle = Self {
            deps,
            signer,
            config,
            state,
            cancel,
            status,
        };
        (cycle, receiver)
    }

    pub fn agent_id(&self) -> &str {
        &self.state.agent_id
    }

    /// Drive the cycle until it is stopped or fails, returning the final state
    pub async fn run(mut self) -> AgentCycleState {
        let agent_id = self.state.agent_id.clone();
        tracing::info!(
            agent_id = %agent_id,
            phase = %self.state.phase,
            wallet = %self.signer.address(),
            "Agent cycle started"
        );

        if let Err(e) = self.drive().await {
            tracing::error!(agent_id = %agent_id, error = %e, "Agent cycle aborted");
            self.fail(&e).await;
        }

        tracing::info!(
            agent_id = %agent_id,
            phase = %self.state.phase,
            completed_cycles = self.state.completed_cycles,
            "Agent cycle ended"
        );
        self.state
    }

    async fn drive(&mut self) -> Result<()> {
        self.resume().await?;
        loop {
            if self.cancel.is_cancelled() && self.state.phase.is_active() {
                self.stop().await?;
            }
            let step = match self.state.phase {
                Phase::AwaitingBuyBalance => self.await_buy_balance().await?,
                Phase::Buying => self.buy().await?,
                Phase::HoldingAwaitingSell => self.hold().await?,
                Phase::Selling => self.sell().await?,
                Phase::Resting => self.rest().await?,
                Phase::Idle | Phase::Stopped | Phase::Failed => return Ok(()),
            };
            if let Step::Cancelled = step {
                self.stop().await?;
            }
        }
    }

    /// Bring a loaded state back into a running phase
    async fn resume(&mut self) -> Result<()> {
        let holding = self.state.purchased_amount > 0;
        match (self.state.phase, self.state.pending_swap.as_ref()) {
            (Phase::Failed, _) => Ok(()),
            (Phase::Idle | Phase::Stopped, Some(pending)) => {
                let side = pending.side;
                tracing::warn!(
                    agent_id = %self.state.agent_id,
                    ?side,
                    "Resuming with an unresolved swap, reconciling before anything else"
                );
                self.apply(CycleSignal::ResumePending { side }, None).await
            }
            (Phase::Idle | Phase::Stopped, None) => {
                let wake_at = holding.then(|| deadline(self.config.sell_delay()));
                self.apply(CycleSignal::Start { holding }, wake_at).await
            }
            (Phase::Buying, None) => self.apply(CycleSignal::Start { holding: false }, None).await,
            (Phase::Selling, None) => {
                self.apply(CycleSignal::Start { holding: true }, Some(Utc::now()))
                    .await
            }
            // Active phases and in-flight swaps pick up where they were
            _ => Ok(()),
        }
    }

    async fn await_buy_balance(&mut self) -> Result<Step> {
        if !self.wait_until(self.state.wake_at).await {
            return Ok(Step::Cancelled);
        }

        // Settings edits land here, between iterations
        self.config = self.deps.configs.agent_config(&self.state.agent_id).await?;
        self.config.validate()?;

        let required = self
            .config
            .buy_amount_lamports
            .saturating_add(self.deps.timing.fee_reserve_lamports);
        let address = self.signer.address();
        let mut announced = false;

        loop {
            let balance = match self.cancellable(self.deps.chain.get_balance(&address)).await {
                None => return Ok(Step::Cancelled),
                Some(result) => result,
            };
            match balance {
                Ok(lamports) => {
                    self.state.last_balance = Some(lamports);
                    self.publish();
                    if lamports >= required {
                        tracing::info!(
                            agent_id = %self.state.agent_id,
                            balance_sol = tokens::lamports_to_sol(lamports),
                            buy_sol = tokens::lamports_to_sol(self.config.buy_amount_lamports),
                            "Balance sufficient, buying"
                        );
                        self.apply(CycleSignal::FundsAvailable, None).await?;
                        return Ok(Step::Advanced);
                    }
                    if !announced {
                        tracing::info!(
                            agent_id = %self.state.agent_id,
                            balance_sol = tokens::lamports_to_sol(lamports),
                            required_sol = tokens::lamports_to_sol(required),
                            "Waiting for funds"
                        );
                        announced = true;
                    }
                }
                Err(e) if e.class() == ErrorClass::Permanent => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(agent_id = %self.state.agent_id, error = %e, "Balance check failed");
                }
            }

            if !self.sleep(self.deps.timing.balance_poll()).await {
                return Ok(Step::Cancelled);
            }
        }
    }

    async fn buy(&mut self) -> Result<Step> {
        if let Some(pending) = self.state.pending_swap.clone() {
            return self.reconcile(pending).await;
        }

        let quote = match self
            .cancellable(self.deps.swapper.get_quote(
                mints::WSOL,
                &self.config.token_mint,
                self.config.buy_amount_lamports,
                self.config.slippage_bps,
            ))
            .await
        {
            None => return Ok(Step::Cancelled),
            Some(Ok(quote)) => quote,
            Some(Err(e)) => {
                self.swap_failed(SwapSide::Buy, e.to_string(), e.class()).await?;
                return Ok(Step::Advanced);
            }
        };

        let outcome = match self
            .submit(SwapSide::Buy, quote.in_amount, quote.min_out_amount, &quote)
            .await?
        {
            Some(outcome) => outcome,
            None => return Ok(Step::Advanced),
        };

        match outcome {
            SwapOutcome::Success {
                signature,
                output_amount,
            } => return self.confirmed_buy(signature, output_amount).await,
            SwapOutcome::Unknown { signature } => {
                return self.swap_unknown(signature).await;
            }
            SwapOutcome::Failed { error } => {
                self.state.pending_swap = None;
                self.swap_failed(SwapSide::Buy, error.to_string(), error.class()).await?;
            }
        }
        Ok(Step::Advanced)
    }

    async fn hold(&mut self) -> Result<Step> {
        if self.state.wake_at.is_none() {
            self.state.wake_at = Some(deadline(self.config.sell_delay()));
        }
        if !self.wait_until(self.state.wake_at).await {
            return Ok(Step::Cancelled);
        }
        self.apply(CycleSignal::SellDue, None).await?;
        Ok(Step::Advanced)
    }

    async fn sell(&mut self) -> Result<Step> {
        if let Some(pending) = self.state.pending_swap.clone() {
            return self.reconcile(pending).await;
        }

        let amount = self.state.purchased_amount;
        if amount == 0 {
            return Err(Error::InvalidTransition(
                "selling without a purchased amount".to_string(),
            ));
        }

        let quote = match self
            .cancellable(self.deps.swapper.get_quote(
                &self.config.token_mint,
                mints::WSOL,
                amount,
                self.config.sell_slippage(),
            ))
            .await
        {
            None => return Ok(Step::Cancelled),
            Some(Ok(quote)) => quote,
            Some(Err(e)) => {
                self.swap_failed(SwapSide::Sell, e.to_string(), e.class()).await?;
                return Ok(Step::Advanced);
            }
        };

        let outcome = match self.submit(SwapSide::Sell, amount, amount, &quote).await? {
            Some(outcome) => outcome,
            None => return Ok(Step::Advanced),
        };

        match outcome {
            SwapOutcome::Success {
                signature,
                output_amount,
            } => self.sold(signature, Some(output_amount)).await?,
            SwapOutcome::Unknown { signature } => {
                return self.swap_unknown(signature).await;
            }
            SwapOutcome::Failed { error } => {
                self.state.pending_swap = None;
                self.swap_failed(SwapSide::Sell, error.to_string(), error.class()).await?;
            }
        }
        Ok(Step::Advanced)
    }

    async fn rest(&mut self) -> Result<Step> {
        if self.state.wake_at.is_none() {
            self.state.wake_at = Some(deadline(self.config.rest_delay()));
        }
        if !self.wait_until(self.state.wake_at).await {
            return Ok(Step::Cancelled);
        }
        self.apply(CycleSignal::RestElapsed, None).await?;
        Ok(Step::Advanced)
    }

    /// Record the pending marker, then execute `quote` to completion.
    ///
    /// Returns `None` when the attempt already failed before submission.
    async fn submit(
        &mut self,
        side: SwapSide,
        amount_in: u64,
        min_expected: u64,
        quote: &QuoteResult,
    ) -> Result<Option<SwapOutcome>> {
        let owner = self.signer.address();
        let baseline = match self
            .deps
            .chain
            .get_token_balance(&owner, &self.config.token_mint)
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                let message = format!("token balance before swap: {}", e);
                self.swap_failed(side, message, e.class()).await?;
                return Ok(None);
            }
        };

        self.state.pending_swap = Some(PendingSwap {
            side,
            amount_in,
            min_expected,
            baseline_token_balance: baseline,
            signature: None,
            submitted_at: Utc::now(),
        });
        self.save().await?;

        tracing::info!(
            agent_id = %self.state.agent_id,
            ?side,
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            min_out = quote.min_out_amount,
            "Executing swap"
        );
        Ok(Some(
            self.deps
                .swapper
                .execute_swap(quote, self.signer.as_ref())
                .await,
        ))
    }

    /// Record a confirmed buy with the token amount that actually arrived.
    ///
    /// The quote's output is only an estimate. When the balance cannot be read
    /// or has not moved yet, the swap is reconciled like an unknown outcome.
    async fn confirmed_buy(&mut self, signature: String, quoted: u64) -> Result<Step> {
        let baseline = match &self.state.pending_swap {
            Some(pending) => pending.baseline_token_balance,
            None => {
                return Err(Error::InvalidTransition(
                    "confirmed buy without a pending marker".to_string(),
                ))
            }
        };
        let owner = self.signer.address();
        let received = match self
            .deps
            .chain
            .get_token_balance(&owner, &self.config.token_mint)
            .await
        {
            Ok(balance) => balance.saturating_sub(baseline),
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.state.agent_id,
                    error = %e,
                    "Token balance after buy unavailable"
                );
                0
            }
        };
        if received == 0 {
            return self.swap_unknown(signature).await;
        }

        if received != quoted {
            tracing::info!(
                agent_id = %self.state.agent_id,
                quoted,
                received,
                "Buy filled away from the quote"
            );
        }
        self.bought(signature, received).await?;
        Ok(Step::Advanced)
    }

    async fn bought(&mut self, signature: String, output_amount: u64) -> Result<()> {
        tracing::info!(
            agent_id = %self.state.agent_id,
            %signature,
            output_amount,
            token = %tokens::display_symbol(&self.config.token_mint),
            "Buy succeeded"
        );
        self.state.pending_swap = None;
        self.state.last_signature = Some(signature);
        self.state.last_output_amount = Some(output_amount);
        self.state.clear_error();

        let sell_enabled = self.config.sell_enabled;
        let wake_at = if sell_enabled {
            self.state.purchased_amount = output_amount;
            deadline(self.config.sell_delay())
        } else {
            // Tokens stay in the wallet; nothing is held for a sell
            self.state.purchased_amount = 0;
            self.state.completed_cycles += 1;
            deadline(self.config.rest_delay())
        };
        self.apply(CycleSignal::Bought { sell_enabled }, Some(wake_at))
            .await
    }

    /// `output_amount` is `None` when the sell was confirmed by reconciliation
    async fn sold(&mut self, signature: String, output_amount: Option<u64>) -> Result<()> {
        tracing::info!(
            agent_id = %self.state.agent_id,
            %signature,
            sold = self.state.purchased_amount,
            received_sol = output_amount.map(tokens::lamports_to_sol),
            "Sell succeeded"
        );
        self.state.pending_swap = None;
        self.state.purchased_amount = 0;
        self.state.last_signature = Some(signature);
        self.state.last_output_amount = output_amount;
        self.state.completed_cycles += 1;
        self.state.clear_error();
        let wake_at = deadline(self.config.rest_delay());
        self.apply(CycleSignal::Sold, Some(wake_at)).await
    }

    async fn swap_unknown(&mut self, signature: String) -> Result<Step> {
        tracing::warn!(
            agent_id = %self.state.agent_id,
            %signature,
            "Swap outcome unknown, reconciling against balances"
        );
        self.state.last_signature = Some(signature.clone());
        let pending = match self.state.pending_swap.as_mut() {
            Some(pending) => {
                pending.signature = Some(signature);
                pending.clone()
            }
            None => {
                return Err(Error::InvalidTransition(
                    "unknown swap outcome without a pending marker".to_string(),
                ))
            }
        };
        self.save().await?;
        self.reconcile(pending).await
    }

    /// Decide a possibly submitted swap from the token balance.
    ///
    /// Balance read failures are retried; the swap is never submitted again.
    async fn reconcile(&mut self, pending: PendingSwap) -> Result<Step> {
        let owner = self.signer.address();
        let mut attempt = 0u32;
        loop {
            if !self.sleep(self.deps.timing.reconcile_settle()).await {
                return Ok(Step::Cancelled);
            }
            attempt += 1;

            let balance = match self
                .deps
                .chain
                .get_token_balance(&owner, &self.config.token_mint)
                .await
            {
                Ok(balance) => balance,
                Err(e) => {
                    tracing::warn!(
                        agent_id = %self.state.agent_id,
                        attempt,
                        error = %e,
                        "Reconciliation balance read failed"
                    );
                    continue;
                }
            };

            let signature = pending
                .signature
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            match pending.side {
                SwapSide::Buy => {
                    let gained = balance.saturating_sub(pending.baseline_token_balance);
                    tracing::info!(
                        agent_id = %self.state.agent_id,
                        baseline = pending.baseline_token_balance,
                        balance,
                        gained,
                        min_expected = pending.min_expected,
                        "Reconciled buy"
                    );
                    if gained > 0 && gained >= pending.min_expected {
                        self.bought(signature, gained).await?;
                    } else {
                        self.state.pending_swap = None;
                        let message = format!("buy {} did not land (gained {})", signature, gained);
                        self.swap_failed(SwapSide::Buy, message, ErrorClass::Unknown).await?;
                    }
                }
                SwapSide::Sell => {
                    let target = pending
                        .baseline_token_balance
                        .saturating_sub(pending.amount_in);
                    tracing::info!(
                        agent_id = %self.state.agent_id,
                        baseline = pending.baseline_token_balance,
                        balance,
                        sold = pending.amount_in,
                        "Reconciled sell"
                    );
                    if balance <= target {
                        self.sold(signature, None).await?;
                    } else {
                        self.state.pending_swap = None;
                        let message = format!("sell {} did not land", signature);
                        self.swap_failed(SwapSide::Sell, message, ErrorClass::Unknown).await?;
                    }
                }
            }
            return Ok(Step::Advanced);
        }
    }

    /// Count a failed attempt; retry after the cooldown or give up
    async fn swap_failed(
        &mut self,
        side: SwapSide,
        message: String,
        class: ErrorClass,
    ) -> Result<()> {
        self.state.consecutive_failures += 1;
        self.state.record_error(message.clone(), class);

        let limit = match side {
            SwapSide::Buy => self.config.buy_retry_limit,
            SwapSide::Sell => self.config.sell_retry_limit,
        };
        let exhausted = self.state.consecutive_failures >= limit;

        tracing::warn!(
            agent_id = %self.state.agent_id,
            ?side,
            ?class,
            failures = self.state.consecutive_failures,
            limit,
            error = %message,
            "Swap attempt failed"
        );

        let signal = match side {
            SwapSide::Buy => CycleSignal::BuyFailed { exhausted },
            SwapSide::Sell => CycleSignal::SellFailed { exhausted },
        };
        let wake_at = (!exhausted).then(|| deadline(self.deps.timing.failure_cooldown()));
        self.apply(signal, wake_at).await
    }

    async fn stop(&mut self) -> Result<()> {
        tracing::info!(agent_id = %self.state.agent_id, phase = %self.state.phase, "Stopping agent cycle");
        self.apply(CycleSignal::Stop, None).await
    }

    /// Move to `Failed` after an error the cycle cannot recover from
    async fn fail(&mut self, error: &Error) {
        let from = self.state.phase;
        self.state.phase = Phase::Failed;
        self.state.wake_at = None;
        self.state.last_transition_at = Utc::now();
        self.state.record_error(error.to_string(), error.class());
        self.publish();
        if let Err(e) = self.deps.commit(from, &self.state).await {
            tracing::error!(agent_id = %self.state.agent_id, error = %e, "Failed to persist failed state");
        }
    }

    /// Validate and take a transition, then persist and announce it
    async fn apply(&mut self, signal: CycleSignal, wake_at: Option<DateTime<Utc>>) -> Result<()> {
        let from = self.state.phase;
        let to = transition(&self.state, &signal)?;
        self.state.phase = to;
        self.state.wake_at = wake_at;
        self.state.last_transition_at = Utc::now();

        tracing::info!(
            agent_id = %self.state.agent_id,
            from = %from,
            to = %to,
            failures = self.state.consecutive_failures,
            "Phase transition"
        );
        self.publish();
        self.deps.commit(from, &self.state).await
    }

    async fn save(&mut self) -> Result<()> {
        self.publish();
        self.deps
            .store
            .save(&self.state.agent_id, &self.state)
            .await?;
        Ok(())
    }

    fn publish(&self) {
        self.status.send_replace(self.state.clone());
    }

    /// Run `fut` unless the cycle is cancelled first
    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Returns false if cancelled before `duration` elapsed
    async fn sleep(&self, duration: Duration) -> bool {
        self.cancellable(tokio::time::sleep(duration)).await.is_some()
    }

    async fn wait_until(&self, wake_at: Option<DateTime<Utc>>) -> bool {
        let remaining = wake_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            return !self.cancel.is_cancelled();
        }
        self.sleep(remaining).await
    }
}

fn deadline(after: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(after) {
        Ok(after) => Utc::now() + after,
        Err(_) => Utc::now(),
    }
}
