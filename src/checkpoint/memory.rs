use async_trait::async_trait;
use breachgraph_common::{RunId, RunState, RunSummary};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{CheckpointStore, check_version};
use crate::errors::StoreError;

/// In-process store. Clones share the same underlying map, which is how tests
/// simulate a process restart: drop the orchestrator, keep the store.
#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    runs: Arc<Mutex<HashMap<RunId, RunState>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, RunState>>, StoreError> {
        self.runs
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("checkpoint lock poisoned: {}", e)))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, run_id: &RunId) -> Result<RunState, StoreError> {
        self.lock()?
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.clone(),
            })
    }

    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let mut runs = self.lock()?;
        let stored = runs.get(&state.run_id).map(|s| s.version);
        check_version(&state.run_id, stored, state.version)?;
        runs.insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RunSummary>, StoreError> {
        let mut summaries: Vec<RunSummary> = self.lock()?.values().map(RunState::summary).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breachgraph_common::Context;

    #[tokio::test]
    async fn load_missing_run_is_not_found() {
        let store = MemoryCheckpointStore::new();
        let err = store.load(&RunId::from("nope")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let store = MemoryCheckpointStore::new();
        let state = RunState::new("enumerate", Context::new());
        store.save(&state).await.unwrap();
        let loaded = store.load(&state.run_id).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn stale_save_is_rejected_and_keeps_newer_state() {
        let store = MemoryCheckpointStore::new();
        let mut state = RunState::new("enumerate", Context::new());
        store.save(&state).await.unwrap();

        let mut stale = state.clone();
        state.bump_version();
        state.current_stage = Some("ingest".into());
        store.save(&state).await.unwrap();

        stale.bump_version();
        stale.current_stage = Some("stale".into());
        let err = store.save(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        let loaded = store.load(&state.run_id).await.unwrap();
        assert_eq!(loaded.current_stage.as_deref(), Some("ingest"));
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let store = MemoryCheckpointStore::new();
        let other = store.clone();
        let state = RunState::new("enumerate", Context::new());
        store.save(&state).await.unwrap();
        assert!(other.load(&state.run_id).await.is_ok());
        assert_eq!(other.list().await.unwrap().len(), 1);
    }
}
