//! Durable, versioned persistence of run state.
//!
//! `save` is the only optimistic-concurrency gate in the system: it succeeds
//! only when the stored version equals `state.version - 1` (a missing record
//! counts as version 0). Everything else about encoding is backend-specific.

use async_trait::async_trait;
use breachgraph_common::{RunId, RunState, RunSummary};

use crate::errors::StoreError;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, run_id: &RunId) -> Result<RunState, StoreError>;

    /// Persist `state`, failing with `VersionConflict` unless the stored
    /// version is exactly `state.version - 1`.
    async fn save(&self, state: &RunState) -> Result<(), StoreError>;

    /// All runs, most recently updated first.
    async fn list(&self) -> Result<Vec<RunSummary>, StoreError>;
}

/// Shared version check used by every backend.
pub(crate) fn check_version(
    run_id: &RunId,
    stored: Option<u64>,
    incoming: u64,
) -> Result<(), StoreError> {
    let found = stored.unwrap_or(0);
    let expected = incoming.saturating_sub(1);
    if incoming == 0 || found != expected {
        return Err(StoreError::VersionConflict {
            run_id: run_id.clone(),
            expected,
            found,
        });
    }
    Ok(())
}
