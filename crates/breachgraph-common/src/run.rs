use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::keys;

/// Named values accumulated across stages. Ordered so serialized checkpoints
/// are byte-stable for identical content.
pub type Context = BTreeMap<String, Value>;

/// Opaque run identifier ("thread").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Allocate a fresh identifier. Backed by a v4 UUID, so never reused.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Invalid run status '{0}'. Valid values: running, paused, completed, failed, cancelled")]
pub struct ParseStatusError(pub String);

impl std::str::FromStr for RunStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// One completed stage execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Outcome tag returned by the handler, or `error` for an unrecoverable failure.
    pub outcome: String,
    /// Context delta the stage produced.
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A human decision the run is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// Stage the run is paused before.
    pub decision_point: String,
    pub prompt: String,
    pub choices: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn offers(&self, decision: &str) -> bool {
        self.choices.iter().any(|c| c == decision)
    }
}

/// Full persisted state of one run. The unit of checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    /// Stage about to execute, or paused before. `None` once terminated.
    pub current_stage: Option<String>,
    pub history: Vec<StageRecord>,
    pub context: Context,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    pub version: u64,
    /// Next audit sequence number to allocate for this run.
    pub next_sequence: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Failure detail for `failed` runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Fresh run positioned at `entry_stage`, at version 1 (the first checkpoint).
    pub fn new(entry_stage: &str, context: Context) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::generate(),
            current_stage: Some(entry_stage.to_string()),
            history: Vec::new(),
            context,
            status: RunStatus::Running,
            pending_approval: None,
            version: 1,
            next_sequence: 1,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    /// Prepare the next checkpoint: bump the version and touch `updated_at`.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Last-write-wins, whole-key merge.
    pub fn merge_context(&mut self, delta: &Context) {
        for (key, value) in delta {
            self.context.insert(key.clone(), value.clone());
        }
    }

    pub fn allocate_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    pub fn has_executed(&self, stage: &str) -> bool {
        self.history.iter().any(|r| r.stage == stage)
    }

    pub fn retry_count(&self, stage: &str) -> u32 {
        retry_count(&self.context, stage)
    }

    pub fn increment_retry(&mut self, stage: &str) -> u32 {
        let count = self.retry_count(stage) + 1;
        let entry = self
            .context
            .entry(keys::RETRY_COUNTS.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if !entry.is_object() {
            *entry = Value::Object(Default::default());
        }
        if let Value::Object(map) = entry {
            map.insert(stage.to_string(), Value::from(count));
        }
        count
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            current_stage: self.current_stage.clone(),
            version: self.version,
            stages_completed: self.history.len(),
            updated_at: self.updated_at,
        }
    }
}

/// Read a stage's revisit counter out of a context map.
pub fn retry_count(context: &Context, stage: &str) -> u32 {
    context
        .get(keys::RETRY_COUNTS)
        .and_then(|v| v.get(stage))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

/// Lightweight listing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub version: u64,
    pub stages_completed: usize,
    pub updated_at: DateTime<Utc>,
}
