use super::{CycleStateStore, StoreError};
use crate::cycle::AgentCycleState;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STATE_EXTENSION: &str = "json";

/// One pretty-printed JSON file per agent under a state directory
///
/// Writes go to a temporary file that is then renamed over the record, so a
/// crash mid-write leaves the previous state intact. Writes for the same agent
/// are serialized; different agents never contend.
pub struct JsonFileStateStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonFileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, agent_id: &str) -> Result<PathBuf, StoreError> {
        let valid = !agent_id.is_empty()
            && agent_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidAgentId(agent_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", agent_id, STATE_EXTENSION)))
    }

    fn lock_for(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl CycleStateStore for JsonFileStateStore {
    async fn load(&self, agent_id: &str) -> Result<Option<AgentCycleState>, StoreError> {
        let path = self.path_for(agent_id)?;
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let state = serde_json::from_str(&content).map_err(|source| StoreError::Corrupt {
            agent_id: agent_id.to_string(),
            source,
        })?;
        Ok(Some(state))
    }

    async fn save(&self, agent_id: &str, state: &AgentCycleState) -> Result<(), StoreError> {
        let path = self.path_for(agent_id)?;
        let content = serde_json::to_string_pretty(state).map_err(|source| StoreError::Corrupt {
            agent_id: agent_id.to_string(),
            source,
        })?;

        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        tracing::trace!(agent_id, phase = %state.phase, path = %path.display(), "Saved cycle state");
        Ok(())
    }

    async fn agent_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(STATE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::{Phase, PendingSwap, SwapSide};
    use chrono::Utc;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path().join("state"));

        assert!(store.load("alpha").await.unwrap().is_none());

        let mut state = AgentCycleState::new("alpha");
        state.phase = Phase::Selling;
        state.purchased_amount = 1000;
        state.pending_swap = Some(PendingSwap {
            side: SwapSide::Sell,
            amount_in: 1000,
            min_expected: 0,
            baseline_token_balance: 1000,
            signature: None,
            submitted_at: Utc::now(),
        });
        store.save("alpha", &state).await.unwrap();

        let loaded = store.load("alpha").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!dir.path().join("state").join("alpha.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path());

        let mut state = AgentCycleState::new("alpha");
        store.save("alpha", &state).await.unwrap();
        state.phase = Phase::Resting;
        state.completed_cycles = 3;
        store.save("alpha", &state).await.unwrap();

        let loaded = store.load("alpha").await.unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Resting);
        assert_eq!(loaded.completed_cycles, 3);
    }

    #[tokio::test]
    async fn test_concurrent_agents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStateStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("agent-{}", i);
                let mut state = AgentCycleState::new(id.clone());
                for cycles in 0..5 {
                    state.completed_cycles = cycles;
                    store.save(&id, &state).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let ids = store.agent_ids().await.unwrap();
        assert_eq!(ids.len(), 8);
        for id in ids {
            assert_eq!(store.load(&id).await.unwrap().unwrap().completed_cycles, 4);
        }
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStateStore::new(dir.path());
        let state = AgentCycleState::new("../escape");

        assert!(matches!(
            store.save("../escape", &state).await,
            Err(StoreError::InvalidAgentId(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.json"), "{ not json").unwrap();
        let store = JsonFileStateStore::new(dir.path());

        assert!(matches!(
            store.load("alpha").await,
            Err(StoreError::Corrupt { .. })
        ));
    }
}
