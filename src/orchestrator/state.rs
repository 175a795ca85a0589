use breachgraph_common::{PendingApproval, RunId, RunState, RunStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Where an `advance`/`resume` invocation left the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Paused {
        run_id: RunId,
        approval: PendingApproval,
    },
    Completed {
        run_id: RunId,
    },
    Failed {
        run_id: RunId,
        stage: Option<String>,
        error: String,
    },
    Cancelled {
        run_id: RunId,
    },
}

impl RunOutcome {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Paused { run_id, .. }
            | Self::Completed { run_id }
            | Self::Failed { run_id, .. }
            | Self::Cancelled { run_id } => run_id,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            Self::Paused { .. } => RunStatus::Paused,
            Self::Completed { .. } => RunStatus::Completed,
            Self::Failed { .. } => RunStatus::Failed,
            Self::Cancelled { .. } => RunStatus::Cancelled,
        }
    }

    /// Outcome for a run that is not `running`. `None` for running runs.
    pub fn from_state(state: &RunState) -> Option<Self> {
        let run_id = state.run_id.clone();
        match state.status {
            RunStatus::Running => None,
            RunStatus::Paused => state
                .pending_approval
                .clone()
                .map(|approval| Self::Paused { run_id, approval }),
            RunStatus::Completed => Some(Self::Completed { run_id }),
            RunStatus::Cancelled => Some(Self::Cancelled { run_id }),
            RunStatus::Failed => Some(Self::Failed {
                run_id,
                stage: state
                    .history
                    .iter()
                    .rev()
                    .find(|r| r.is_error())
                    .or(state.history.last())
                    .map(|r| r.stage.clone()),
                error: state
                    .error
                    .clone()
                    .unwrap_or_else(|| "run failed".to_string()),
            }),
        }
    }
}

/// Runs currently being driven by this process, each with a cooperative
/// cancel flag.
#[derive(Debug, Default)]
pub struct InFlightRuns {
    runs: Mutex<HashMap<RunId, Arc<AtomicBool>>>,
}

impl InFlightRuns {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, Arc<AtomicBool>>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `run_id`. `None` if another task in this process holds it.
    pub fn acquire(self: &Arc<Self>, run_id: &RunId) -> Option<RunGuard> {
        let mut runs = self.lock();
        if runs.contains_key(run_id) {
            return None;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        runs.insert(run_id.clone(), cancel.clone());
        Some(RunGuard {
            runs: Arc::clone(self),
            run_id: run_id.clone(),
            cancel,
        })
    }

    /// Raise the cancel flag of an in-flight run. `false` if not in flight.
    pub fn request_cancel(&self, run_id: &RunId) -> bool {
        match self.lock().get(run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

/// Exclusive claim on a run; released on drop.
#[derive(Debug)]
pub struct RunGuard {
    runs: Arc<InFlightRuns>,
    run_id: RunId,
    cancel: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.lock().remove(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breachgraph_common::{Context, StageRecord};
    use chrono::Utc;

    #[test]
    fn second_claim_fails_until_released() {
        let runs = Arc::new(InFlightRuns::new());
        let id = RunId::from("r1");
        let guard = runs.acquire(&id).unwrap();
        assert!(runs.acquire(&id).is_none());
        assert!(runs.request_cancel(&id));
        drop(guard);
        assert!(!runs.request_cancel(&id));
        assert!(runs.acquire(&id).is_some());
    }

    #[test]
    fn cancel_reaches_the_guard() {
        let runs = Arc::new(InFlightRuns::new());
        let id = RunId::from("r1");
        assert!(!runs.request_cancel(&id));
        let guard = runs.acquire(&id).unwrap();
        assert!(!guard.cancel_requested());
        assert!(runs.request_cancel(&id));
        assert!(guard.cancel_requested());
    }

    #[test]
    fn outcome_from_failed_state_names_failing_stage() {
        let mut state = RunState::new("enumerate", Context::new());
        let now = Utc::now();
        state.history.push(StageRecord {
            stage: "translate".into(),
            started_at: now,
            ended_at: now,
            outcome: "error".into(),
            result: serde_json::Value::Null,
            error: Some("boom".into()),
        });
        state.status = RunStatus::Failed;
        state.error = Some("Stage 'translate' failed: boom".into());
        match RunOutcome::from_state(&state).unwrap() {
            RunOutcome::Failed { stage, error, .. } => {
                assert_eq!(stage.as_deref(), Some("translate"));
                assert!(error.contains("boom"));
            }
            other => panic!("Expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn running_state_has_no_outcome() {
        let state = RunState::new("enumerate", Context::new());
        assert!(RunOutcome::from_state(&state).is_none());
    }
}
