//! Cycle supervisor
//!
//! Owns the agent id -> running cycle registry. The registry lock only guards
//! membership: it is never held across a network call or while waiting on a
//! cycle task.

use crate::cycle::{transition, AgentCycle, AgentCycleState, CycleDeps, CycleSignal, Phase};
use crate::error::ErrorClass;
use crate::wallet::SignerProvider;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Result of a start request
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", content = "state", rename_all = "snake_case")]
pub enum StartReport {
    Started(AgentCycleState),
    /// A cycle was already running; nothing was spawned
    AlreadyRunning(AgentCycleState),
    /// The agent is failed and needs a reset before it can run again
    Failed(AgentCycleState),
}

impl StartReport {
    pub fn state(&self) -> &AgentCycleState {
        match self {
            StartReport::Started(state)
            | StartReport::AlreadyRunning(state)
            | StartReport::Failed(state) => state,
        }
    }

    pub fn spawned(&self) -> bool {
        matches!(self, StartReport::Started(_))
    }
}

struct CycleHandle {
    cancel: CancellationToken,
    /// Taken by `stop` while it waits for the task; the entry stays registered
    /// until the join completes
    task: Option<JoinHandle<AgentCycleState>>,
    status: watch::Receiver<AgentCycleState>,
}

impl CycleHandle {
    fn is_running(&self) -> bool {
        self.task.as_ref().map_or(true, |task| !task.is_finished())
    }
}

type Registry = Mutex<HashMap<String, CycleHandle>>;

fn lock_registry(agents: &Registry) -> MutexGuard<'_, HashMap<String, CycleHandle>> {
    match agents.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A task taken out of the registry by `stop`.
///
/// If the stopping future is dropped before the join completes, the task is
/// handed back to its registry entry so a later `stop` can still join it.
struct StoppingTask<'a> {
    agents: &'a Registry,
    agent_id: &'a str,
    task: Option<JoinHandle<AgentCycleState>>,
}

impl StoppingTask<'_> {
    async fn join(&mut self) -> Option<std::result::Result<AgentCycleState, JoinError>> {
        let result = match self.task.as_mut() {
            Some(task) => task.await,
            None => return None,
        };
        self.task = None;
        lock_registry(self.agents).remove(self.agent_id);
        Some(result)
    }
}

impl Drop for StoppingTask<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if let Some(handle) = lock_registry(self.agents).get_mut(self.agent_id) {
                handle.task = Some(task);
            }
        }
    }
}

pub struct CycleSupervisor {
    deps: CycleDeps,
    signers: Arc<dyn SignerProvider>,
    agents: Registry,
}

impl CycleSupervisor {
    pub fn new(deps: CycleDeps, signers: Arc<dyn SignerProvider>) -> Self {
        Self {
            deps,
            signers,
            agents: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, CycleHandle>> {
        lock_registry(&self.agents)
    }

    fn running_status(&self, agent_id: &str) -> Option<AgentCycleState> {
        self.registry()
            .get(agent_id)
            .filter(|handle| handle.is_running())
            .map(|handle| handle.status.borrow().clone())
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.running_status(agent_id).is_some()
    }

    pub fn running_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .registry()
            .iter()
            .filter(|(_, handle)| handle.is_running())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Start an agent's cycle unless one is already running
    pub async fn start(&self, agent_id: &str) -> Result<StartReport> {
        if let Some(state) = self.running_status(agent_id) {
            if state.phase == Phase::Failed {
                return Ok(StartReport::Failed(state));
            }
            tracing::debug!(agent_id, phase = %state.phase, "Agent already running");
            return Ok(StartReport::AlreadyRunning(state));
        }

        let config = self.deps.configs.agent_config(agent_id).await?;
        config.validate()?;
        let signer = self.signers.signer_for(agent_id)?;
        let state = self
            .deps
            .store
            .load(agent_id)
            .await?
            .unwrap_or_else(|| AgentCycleState::new(agent_id));

        if state.phase == Phase::Failed {
            tracing::warn!(
                agent_id,
                error = state.last_error.as_deref().unwrap_or("unknown"),
                "Agent is failed; reset it before starting"
            );
            return Ok(StartReport::Failed(state));
        }

        let mut agents = self.registry();
        if let Some(handle) = agents.get(agent_id).filter(|handle| handle.is_running()) {
            return Ok(StartReport::AlreadyRunning(handle.status.borrow().clone()));
        }

        let cancel = CancellationToken::new();
        let (cycle, status) = AgentCycle::new(
            self.deps.clone(),
            signer,
            config,
            state.clone(),
            cancel.clone(),
        );
        let span = tracing::info_span!("agent_cycle", agent_id);
        let task =
            tokio::spawn(supervise(cycle, status.clone(), self.deps.clone()).instrument(span));
        agents.insert(
            agent_id.to_string(),
            CycleHandle {
                cancel,
                task: Some(task),
                status,
            },
        );

        tracing::info!(agent_id, phase = %state.phase, "Agent cycle spawned");
        Ok(StartReport::Started(state))
    }

    /// Stop an agent at its next safe point and return its final state.
    ///
    /// The agent stays registered, and so counts as running, until its task
    /// has finished. A swap in flight therefore blocks restarts and resets.
    pub async fn stop(&self, agent_id: &str) -> Result<Option<AgentCycleState>> {
        let taken = self.registry().get_mut(agent_id).map(|handle| {
            handle.cancel.cancel();
            (handle.task.take(), handle.status.clone())
        });
        let task = match taken {
            None => return Ok(self.deps.store.load(agent_id).await?),
            Some((Some(task), _)) => task,
            Some((None, mut status)) => {
                // Another caller is joining the task; wait for the cycle to end
                while status.changed().await.is_ok() {}
                return Ok(self.deps.store.load(agent_id).await?);
            }
        };

        let mut stopping = StoppingTask {
            agents: &self.agents,
            agent_id,
            task: Some(task),
        };
        let state = match stopping.join().await {
            Some(result) => {
                result.map_err(|e| Error::Task(format!("agent {}: {}", agent_id, e)))?
            }
            None => return Ok(self.deps.store.load(agent_id).await?),
        };
        tracing::info!(agent_id, phase = %state.phase, "Agent cycle stopped");
        Ok(Some(state))
    }

    /// Live state of a running agent, else its persisted state
    pub async fn status(&self, agent_id: &str) -> Result<Option<AgentCycleState>> {
        match self.running_status(agent_id) {
            Some(state) => Ok(Some(state)),
            None => Ok(self.deps.store.load(agent_id).await?),
        }
    }

    /// Clear a stopped or failed agent back to `Idle`.
    ///
    /// Held tokens and any unresolved swap marker are kept, so the next start
    /// sells or reconciles them.
    pub async fn reset(&self, agent_id: &str) -> Result<AgentCycleState> {
        if self.is_running(agent_id) {
            return Err(Error::InvalidTransition(format!(
                "agent {} is running; stop it before resetting",
                agent_id
            )));
        }
        self.deps.configs.agent_config(agent_id).await?;

        let mut state = self
            .deps
            .store
            .load(agent_id)
            .await?
            .unwrap_or_else(|| AgentCycleState::new(agent_id));
        let from = state.phase;
        state.phase = transition(&state, &CycleSignal::Reset)?;
        state.clear_error();
        state.wake_at = None;
        state.last_transition_at = Utc::now();
        self.deps.commit(from, &state).await?;

        let mut agents = self.registry();
        if agents.get(agent_id).is_some_and(|handle| !handle.is_running()) {
            agents.remove(agent_id);
        }
        drop(agents);
        tracing::info!(agent_id, from = %from, "Agent reset");
        Ok(state)
    }

    /// Start every agent of `owner`, spacing out the spawns
    pub async fn start_owner(&self, owner: &str) -> Result<Vec<(String, Result<StartReport>)>> {
        let ids = self.deps.configs.agents_for_owner(owner).await?;
        let stagger = self.deps.timing.start_stagger();

        let mut reports = Vec::with_capacity(ids.len());
        let mut spawned_any = false;
        for agent_id in ids {
            if spawned_any && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
            let report = self.start(&agent_id).await;
            match &report {
                Ok(report) => spawned_any |= report.spawned(),
                Err(e) => tracing::warn!(owner, agent_id = %agent_id, error = %e, "Failed to start agent"),
            }
            reports.push((agent_id, report));
        }
        Ok(reports)
    }

    /// Stop every running agent, waiting for in-flight swaps to resolve
    pub async fn stop_all(&self) -> Vec<AgentCycleState> {
        let ids: Vec<String> = self.registry().keys().cloned().collect();
        tracing::info!(count = ids.len(), "Stopping all agent cycles");

        let results = futures::future::join_all(
            ids.iter()
                .map(|agent_id| async move { (agent_id, self.stop(agent_id).await) }),
        )
        .await;

        results
            .into_iter()
            .filter_map(|(agent_id, result)| match result {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "Agent task did not finish cleanly");
                    None
                }
            })
            .collect()
    }
}

/// Run a cycle in its own task so a panic lands here instead of in a sibling
async fn supervise(
    cycle: AgentCycle,
    status: watch::Receiver<AgentCycleState>,
    deps: CycleDeps,
) -> AgentCycleState {
    let error = match tokio::spawn(cycle.run().in_current_span()).await {
        Ok(state) => return state,
        Err(e) => e,
    };

    let reason = if error.is_panic() {
        let payload = error.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        format!("cycle task panicked: {}", message)
    } else {
        "cycle task was cancelled".to_string()
    };

    let mut state = status.borrow().clone();
    let from = state.phase;
    let class = if state.pending_swap.is_some() {
        ErrorClass::Unknown
    } else {
        ErrorClass::Permanent
    };
    state.phase = Phase::Failed;
    state.wake_at = None;
    state.last_transition_at = Utc::now();
    state.record_error(reason.clone(), class);

    tracing::error!(agent_id = %state.agent_id, from = %from, error = %reason, "Agent cycle crashed");
    if let Err(e) = deps.commit(from, &state).await {
        tracing::error!(agent_id = %state.agent_id, error = %e, "Failed to persist crashed state");
    }
    state
}
