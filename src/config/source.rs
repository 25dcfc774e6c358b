//! Agent configuration source
//!
//! Settings storage is owned by the bot front-end. The engine reads one
//! [`AgentConfig`] snapshot per cycle iteration through this trait.

use super::AgentConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait AgentConfigSource: Send + Sync {
    /// Current settings for one agent
    async fn agent_config(&self, agent_id: &str) -> Result<AgentConfig>;

    /// Ids of every agent belonging to `owner`
    async fn agents_for_owner(&self, owner: &str) -> Result<Vec<String>>;
}

/// In-process configuration source; updates become visible at the next iteration
#[derive(Clone, Default)]
pub struct InMemoryConfigSource {
    agents: Arc<RwLock<HashMap<String, AgentConfig>>>,
}

impl InMemoryConfigSource {
    pub fn new(agents: impl IntoIterator<Item = AgentConfig>) -> Self {
        let map = agents
            .into_iter()
            .map(|agent| (agent.agent_id.clone(), agent))
            .collect();
        Self {
            agents: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace an agent's settings after validating them
    pub async fn upsert(&self, agent: AgentConfig) -> Result<()> {
        agent.validate()?;
        self.agents
            .write()
            .await
            .insert(agent.agent_id.clone(), agent);
        Ok(())
    }

    /// Apply an edit to an existing agent's settings
    pub async fn update<F>(&self, agent_id: &str, edit: F) -> Result<AgentConfig>
    where
        F: FnOnce(&mut AgentConfig) + Send,
    {
        let mut agents = self.agents.write().await;
        let current = agents
            .get(agent_id)
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))?;
        let mut updated = current.clone();
        edit(&mut updated);
        updated.validate()?;
        agents.insert(agent_id.to_string(), updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl AgentConfigSource for InMemoryConfigSource {
    async fn agent_config(&self, agent_id: &str) -> Result<AgentConfig> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))
    }

    async fn agents_for_owner(&self, owner: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .await
            .values()
            .filter(|agent| agent.owner == owner)
            .map(|agent| agent.agent_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BONK: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

    #[tokio::test]
    async fn test_update_is_validated() {
        let source = InMemoryConfigSource::new([AgentConfig::new("alpha", "42", BONK, 500_000_000)]);

        let updated = source
            .update("alpha", |agent| agent.sell_delay_secs = 90)
            .await
            .unwrap();
        assert_eq!(updated.sell_delay_secs, 90);
        assert_eq!(source.agent_config("alpha").await.unwrap().sell_delay_secs, 90);

        let rejected = source
            .update("alpha", |agent| agent.buy_amount_lamports = 1)
            .await;
        assert!(rejected.is_err());
        assert_eq!(
            source.agent_config("alpha").await.unwrap().buy_amount_lamports,
            500_000_000
        );
    }

    #[tokio::test]
    async fn test_agents_for_owner() {
        let source = InMemoryConfigSource::new([
            AgentConfig::new("b", "42", BONK, 500_000_000),
            AgentConfig::new("a", "42", BONK, 500_000_000),
            AgentConfig::new("c", "7", BONK, 500_000_000),
        ]);
        assert_eq!(source.agents_for_owner("42").await.unwrap(), vec!["a", "b"]);
        assert!(source.agents_for_owner("nobody").await.unwrap().is_empty());
        assert!(matches!(
            source.agent_config("zzz").await,
            Err(Error::UnknownAgent(_))
        ));
    }
}
