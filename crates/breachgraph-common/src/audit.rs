use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    StageStart,
    StageEnd,
    RouteDecision,
    Pause,
    Resume,
    Cancel,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StageStart => "stage_start",
            Self::StageEnd => "stage_end",
            Self::RouteDecision => "route_decision",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Redacted description of a payload: shape and fingerprint, never values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSummary {
    pub keys: Vec<String>,
    pub bytes: usize,
    /// Hex SHA-256 of the serialized payload.
    pub digest: String,
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: RunId,
    pub sequence: u64,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PayloadSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(run_id: &RunId, sequence: u64, event_type: AuditEventType) -> Self {
        Self {
            run_id: run_id.clone(),
            sequence,
            event_type,
            timestamp: Utc::now(),
            stage: None,
            outcome: None,
            summary: None,
            detail: None,
        }
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_outcome(mut self, outcome: &str) -> Self {
        self.outcome = Some(outcome.to_string());
        self
    }

    pub fn with_summary(mut self, summary: PayloadSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
