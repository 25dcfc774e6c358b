//! Cycle state persistence
//!
//! One record per agent, written after every phase transition so a restarted
//! process resumes each agent where it left off.

mod file;

pub use file::JsonFileStateStore;

use crate::cycle::AgentCycleState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt state for agent {agent_id}: {source}")]
    Corrupt {
        agent_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Agent id {0:?} cannot be used as a state key")]
    InvalidAgentId(String),
}

#[async_trait]
pub trait CycleStateStore: Send + Sync {
    async fn load(&self, agent_id: &str) -> Result<Option<AgentCycleState>, StoreError>;

    async fn save(&self, agent_id: &str, state: &AgentCycleState) -> Result<(), StoreError>;

    /// Ids of every agent with a persisted state
    async fn agent_ids(&self) -> Result<Vec<String>, StoreError>;
}

/// Non-durable store, for tests and dry runs
#[derive(Default)]
pub struct MemoryStateStore {
    states: RwLock<HashMap<String, AgentCycleState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CycleStateStore for MemoryStateStore {
    async fn load(&self, agent_id: &str) -> Result<Option<AgentCycleState>, StoreError> {
        Ok(self.states.read().await.get(agent_id).cloned())
    }

    async fn save(&self, agent_id: &str, state: &AgentCycleState) -> Result<(), StoreError> {
        self.states
            .write()
            .await
            .insert(agent_id.to_string(), state.clone());
        Ok(())
    }

    async fn agent_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.states.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
