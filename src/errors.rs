//! Typed error hierarchy for the breachgraph orchestrator.
//!
//! - `OrchestratorError`: what `start`/`advance`/`resume`/`cancel` surface to callers
//! - `StoreError`: checkpoint persistence, including optimistic-concurrency conflicts
//! - `AuditError`: audit log appends and reads
//! - `ConfigurationError`: routing/registry problems, detected before any run executes
//! - `StageError`: unrecoverable stage failures; these end a run as `failed`
//!   and are reported through the run outcome, not as `Err`

use breachgraph_common::{RunId, RunStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run {run_id} not found")]
    NotFound { run_id: RunId },

    #[error("Run {run_id} is being advanced by another writer")]
    ConcurrentRun { run_id: RunId },

    #[error("Decision '{decision}' is not one of the offered choices [{}] for run {run_id}", .choices.join(", "))]
    InvalidDecision {
        run_id: RunId,
        decision: String,
        choices: Vec<String>,
    },

    #[error("Cannot {operation} run {run_id} while it is {status}")]
    InvalidState {
        run_id: RunId,
        status: RunStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Checkpoint store error: {0}")]
    Storage(#[source] StoreError),

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { run_id } => OrchestratorError::NotFound { run_id },
            StoreError::VersionConflict { run_id, .. } => {
                OrchestratorError::ConcurrentRun { run_id }
            }
            other => OrchestratorError::Storage(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {run_id} not found")]
    NotFound { run_id: RunId },

    #[error("Version conflict for run {run_id}: expected stored version {expected}, found {found}")]
    VersionConflict {
        run_id: RunId,
        expected: u64,
        found: u64,
    },

    #[error("Failed to encode/decode run state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit entry {sequence} for run {run_id} is out of order (last appended: {last})")]
    OutOfOrder {
        run_id: RunId,
        sequence: u64,
        last: u64,
    },

    #[error("Audit log I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode/decode audit entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Audit backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Stage '{stage}' declares outcome '{outcome}' but the routing table has no entry for it")]
    MissingRoute { stage: String, outcome: String },

    #[error("Route {stage}:{outcome} targets unknown stage '{target}'")]
    UnknownTarget {
        stage: String,
        outcome: String,
        target: String,
    },

    #[error("Routing table has entries for unregistered stage '{stage}'")]
    UnroutedStage { stage: String },

    #[error("Entry stage '{stage}' is not registered")]
    UnknownEntryStage { stage: String },

    #[error("Stage '{stage}' is registered twice")]
    DuplicateStage { stage: String },

    #[error("Pause before '{stage}' offers no choices")]
    EmptyChoices { stage: String },

    #[error("No stages registered")]
    EmptyRegistry,
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage '{stage}' failed: {source:#}")]
    Handler {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage '{stage}' returned undeclared outcome '{outcome}'")]
    UndeclaredOutcome { stage: String, outcome: String },

    #[error("Stage '{stage}' exceeded its retry limit ({attempts} revisits, max {max})")]
    RetryLimitExceeded { stage: String, attempts: u32, max: u32 },
}

impl StageError {
    pub fn stage(&self) -> &str {
        match self {
            StageError::Handler { stage, .. }
            | StageError::UndeclaredOutcome { stage, .. }
            | StageError::RetryLimitExceeded { stage, .. } => stage,
        }
    }
}
