use breachgraph_common::keys::{self, outcome};
use breachgraph_common::{
    AuditEntry, AuditEventType, Context, NextStep, PendingApproval, RunId, RunState, RunStatus,
    RunSummary, StageRecord, TerminalStatus,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};

use super::router::{Router, RoutingTable};
use super::state::{InFlightRuns, RunGuard, RunOutcome};
use crate::audit::{AuditLease, AuditLog, summarize_payload};
use crate::checkpoint::CheckpointStore;
use crate::errors::{AuditError, ConfigurationError, OrchestratorError, StageError};
use crate::stage::{StageOutput, StageRegistry};

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Drives runs stage by stage.
///
/// Per step: append `stage_start`, execute the handler, append `stage_end`
/// and `route_decision` (plus `pause` when the router pauses), then
/// checkpoint. A checkpoint is only written after the audit entries it covers
/// are durable, and never while a handler is executing.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    registry: StageRegistry,
    router: Router,
    store: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditLog>,
    in_flight: Arc<InFlightRuns>,
}

/// Exclusive right to drive a run: the in-process guard plus the audit lease
/// that fences out other orchestrators sharing the log.
struct Claim {
    run: RunGuard,
    _lease: AuditLease,
}

/// Result of executing one stage, before routing.
enum Executed {
    Output(StageOutput),
    Failed(StageError),
}

impl Orchestrator {
    /// Validate the routing table against the registry and build the driver.
    pub fn new(
        registry: StageRegistry,
        table: RoutingTable,
        store: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditLog>,
    ) -> std::result::Result<Self, ConfigurationError> {
        let router = Router::new(table, &registry)?;
        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                router,
                store,
                audit,
                in_flight: Arc::new(InFlightRuns::new()),
            }),
        })
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.inner.registry
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    /// Persist a fresh run at the entry stage without executing anything.
    /// Reserved keys in `input` are dropped.
    pub async fn create_run(&self, mut input: Context) -> Result<RunId> {
        input.retain(|key, _| {
            let reserved = keys::is_reserved(key);
            if reserved {
                warn!(key = %key, "Ignoring reserved key in initial input");
            }
            !reserved
        });
        let state = RunState::new(self.inner.registry.entry(), input);
        self.inner.store.save(&state).await?;
        info!(run_id = %state.run_id, entry = %self.inner.registry.entry(), "Run created");
        Ok(state.run_id)
    }

    /// Create a run and drive it in the background. Poll with [`Self::status`].
    pub async fn start(&self, input: Context) -> Result<RunId> {
        let run_id = self.create_run(input).await?;
        let this = self.clone();
        let id = run_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.advance(&id).await {
                warn!(run_id = %id, error = %e, "Background advance failed");
            }
        });
        Ok(run_id)
    }

    /// Create a run and drive it until it pauses or terminates.
    pub async fn start_blocking(&self, input: Context) -> Result<RunOutcome> {
        let run_id = self.create_run(input).await?;
        self.advance(&run_id).await
    }

    /// Drive `run_id` from its persisted position until it pauses or terminates.
    pub async fn advance(&self, run_id: &RunId) -> Result<RunOutcome> {
        let claim = self.claim(run_id).await?;
        let state = self.inner.store.load(run_id).await?;
        self.drive(state, &claim.run)
            .instrument(info_span!("advance", run_id = %run_id))
            .await
    }

    /// Record a human decision for a paused run and continue driving it.
    pub async fn resume(&self, run_id: &RunId, decision: &str) -> Result<RunOutcome> {
        let claim = self.claim(run_id).await?;
        let mut state = self.inner.store.load(run_id).await?;
        if state.status != RunStatus::Paused {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.clone(),
                status: state.status,
                operation: "resume",
            });
        }
        let approval = state.pending_approval.clone().ok_or_else(|| {
            OrchestratorError::Other(anyhow::anyhow!(
                "Run {} is paused without a pending approval",
                run_id
            ))
        })?;
        if !approval.offers(decision) {
            return Err(OrchestratorError::InvalidDecision {
                run_id: run_id.clone(),
                decision: decision.to_string(),
                choices: approval.choices,
            });
        }

        self.reconcile_sequence(&mut state).await?;
        state
            .context
            .insert(keys::HUMAN_DECISION.to_string(), Value::from(decision));
        state.context.insert(
            keys::HUMAN_DECISION_POINT.to_string(),
            Value::from(approval.decision_point.as_str()),
        );
        state.pending_approval = None;
        state.status = RunStatus::Running;
        let seq = state.allocate_sequence();
        self.append(
            AuditEntry::new(run_id, seq, AuditEventType::Resume)
                .with_stage(&approval.decision_point)
                .with_outcome(decision),
        )
        .await?;
        state.bump_version();
        self.inner.store.save(&state).await?;
        info!(run_id = %run_id, stage = %approval.decision_point, decision, "Run resumed");

        self.drive(state, &claim.run)
            .instrument(info_span!("resume", run_id = %run_id))
            .await
    }

    /// Cancel a non-terminal run.
    ///
    /// If this process is currently driving the run, the cancel flag is raised
    /// and the driver checkpoints `cancelled` at its next stage boundary. A run
    /// being driven by another orchestrator yields `ConcurrentRun`.
    pub async fn cancel(&self, run_id: &RunId) -> Result<()> {
        let guard = loop {
            if let Some(guard) = self.inner.in_flight.acquire(run_id) {
                break guard;
            }
            if self.inner.in_flight.request_cancel(run_id) {
                info!(run_id = %run_id, "Cancellation requested for in-flight run");
                return Ok(());
            }
        };
        let _lease = self.lease(run_id).await?;
        let mut state = self.inner.store.load(run_id).await?;
        if state.status.is_terminal() {
            return Err(OrchestratorError::InvalidState {
                run_id: run_id.clone(),
                status: state.status,
                operation: "cancel",
            });
        }
        self.reconcile_sequence(&mut state).await?;
        self.commit_cancel(&mut state).await?;
        drop(guard);
        Ok(())
    }

    /// Latest persisted state.
    pub async fn status(&self, run_id: &RunId) -> Result<RunState> {
        Ok(self.inner.store.load(run_id).await?)
    }

    pub async fn list(&self) -> Result<Vec<RunSummary>> {
        Ok(self.inner.store.list().await?)
    }

    pub async fn audit_trail(&self, run_id: &RunId) -> Result<Vec<AuditEntry>> {
        Ok(self.inner.audit.read(run_id).await?)
    }

    async fn claim(&self, run_id: &RunId) -> Result<Claim> {
        let run = self
            .inner
            .in_flight
            .acquire(run_id)
            .ok_or_else(|| OrchestratorError::ConcurrentRun {
                run_id: run_id.clone(),
            })?;
        let lease = self.lease(run_id).await?;
        Ok(Claim { run, _lease: lease })
    }

    async fn lease(&self, run_id: &RunId) -> Result<AuditLease> {
        self.inner
            .audit
            .lease(run_id)
            .await
            .map_err(|e| self.audit_error(run_id, e))?
            .ok_or_else(|| {
                debug!(run_id = %run_id, "Audit lease held elsewhere");
                OrchestratorError::ConcurrentRun {
                    run_id: run_id.clone(),
                }
            })
    }

    /// Skip sequence numbers used by an attempt that never checkpointed.
    /// Only called under the audit lease, so that attempt is no longer alive.
    async fn reconcile_sequence(&self, state: &mut RunState) -> Result<()> {
        let last = self
            .inner
            .audit
            .last_sequence(&state.run_id)
            .await
            .map_err(|e| self.audit_error(&state.run_id, e))?;
        if state.next_sequence <= last {
            debug!(
                run_id = %state.run_id,
                persisted = state.next_sequence,
                last,
                "Skipping audit sequence numbers from an uncommitted attempt"
            );
            state.next_sequence = last + 1;
        }
        Ok(())
    }

    async fn append(&self, entry: AuditEntry) -> Result<()> {
        let run_id = entry.run_id.clone();
        self.inner
            .audit
            .append(&entry)
            .await
            .map_err(|e| self.audit_error(&run_id, e))
    }

    /// A sequence collision means another writer is appending for this run.
    fn audit_error(&self, run_id: &RunId, err: AuditError) -> OrchestratorError {
        match err {
            AuditError::OutOfOrder { .. } => OrchestratorError::ConcurrentRun {
                run_id: run_id.clone(),
            },
            other => OrchestratorError::Audit(other),
        }
    }

    async fn checkpoint(&self, state: &mut RunState) -> Result<()> {
        state.bump_version();
        self.inner.store.save(state).await?;
        debug!(
            run_id = %state.run_id,
            version = state.version,
            status = %state.status,
            "Checkpoint committed"
        );
        Ok(())
    }

    async fn commit_cancel(&self, state: &mut RunState) -> Result<()> {
        let seq = state.allocate_sequence();
        let mut entry = AuditEntry::new(&state.run_id, seq, AuditEventType::Cancel);
        if let Some(stage) = &state.current_stage {
            entry = entry.with_stage(stage);
        }
        self.append(entry.with_detail(format!("cancelled while {}", state.status)))
            .await?;
        state.status = RunStatus::Cancelled;
        state.pending_approval = None;
        self.checkpoint(state).await?;
        info!(run_id = %state.run_id, "Run cancelled");
        Ok(())
    }

    async fn drive(&self, mut state: RunState, guard: &RunGuard) -> Result<RunOutcome> {
        if state.status != RunStatus::Running {
            debug!(status = %state.status, "Run is not runnable; nothing to do");
            return RunOutcome::from_state(&state).ok_or_else(|| {
                OrchestratorError::Other(anyhow::anyhow!(
                    "Run {} is {} without a pending approval",
                    state.run_id,
                    state.status
                ))
            });
        }
        self.reconcile_sequence(&mut state).await?;

        loop {
            if guard.cancel_requested() {
                self.commit_cancel(&mut state).await?;
                return Ok(RunOutcome::Cancelled {
                    run_id: state.run_id.clone(),
                });
            }

            let stage = state.current_stage.clone().ok_or_else(|| {
                OrchestratorError::Other(anyhow::anyhow!(
                    "Run {} is running without a current stage",
                    state.run_id
                ))
            })?;

            let seq = state.allocate_sequence();
            self.append(
                AuditEntry::new(&state.run_id, seq, AuditEventType::StageStart)
                    .with_stage(&stage)
                    .with_summary(summarize_payload(&context_value(&state.context))),
            )
            .await?;

            let started_at = Utc::now();
            let executed = self.execute(&stage, &state.context).await;
            let ended_at = Utc::now();

            let output = match executed {
                Executed::Output(output) => output,
                Executed::Failed(err) => {
                    return self.fail(&mut state, &stage, started_at, ended_at, err).await;
                }
            };

            state.merge_context(&output.delta);
            let delta = context_value(&output.delta);
            state.history.push(StageRecord {
                stage: stage.clone(),
                started_at,
                ended_at,
                outcome: output.outcome.clone(),
                result: delta.clone(),
                error: None,
            });
            let seq = state.allocate_sequence();
            self.append(
                AuditEntry::new(&state.run_id, seq, AuditEventType::StageEnd)
                    .with_stage(&stage)
                    .with_outcome(&output.outcome)
                    .with_summary(summarize_payload(&delta)),
            )
            .await?;
            info!(
                stage = %stage,
                outcome = %output.outcome,
                duration_ms = (ended_at - started_at).num_milliseconds(),
                "Stage finished"
            );

            let next = match self.next_step(&mut state, &stage, &output.outcome) {
                Ok(next) => next,
                Err(err) => {
                    let now = Utc::now();
                    let refused = err.stage().to_string();
                    return self.fail(&mut state, &refused, now, now, err).await;
                }
            };

            let seq = state.allocate_sequence();
            self.append(
                AuditEntry::new(&state.run_id, seq, AuditEventType::RouteDecision)
                    .with_stage(&stage)
                    .with_outcome(&output.outcome)
                    .with_detail(next.to_string()),
            )
            .await?;

            match next {
                NextStep::Stage { stage: target } => {
                    state.current_stage = Some(target);
                    self.checkpoint(&mut state).await?;
                }
                NextStep::Pause {
                    stage: target,
                    prompt,
                    choices,
                } => {
                    if guard.cancel_requested() {
                        state.current_stage = Some(target);
                        continue;
                    }
                    let seq = state.allocate_sequence();
                    self.append(
                        AuditEntry::new(&state.run_id, seq, AuditEventType::Pause)
                            .with_stage(&target)
                            .with_detail(prompt.clone()),
                    )
                    .await?;
                    let approval = PendingApproval {
                        decision_point: target.clone(),
                        prompt,
                        choices,
                        requested_at: Utc::now(),
                    };
                    state.current_stage = Some(target);
                    state.pending_approval = Some(approval.clone());
                    state.status = RunStatus::Paused;
                    self.checkpoint(&mut state).await?;
                    info!(stage = %approval.decision_point, "Run paused for approval");
                    return Ok(RunOutcome::Paused {
                        run_id: state.run_id.clone(),
                        approval,
                    });
                }
                NextStep::Terminal { status } => {
                    state.current_stage = None;
                    state.status = status.into();
                    if status == TerminalStatus::Failed {
                        state.error = Some(format!(
                            "Stage '{}' reported '{}', which routes to failed",
                            stage, output.outcome
                        ));
                    }
                    self.checkpoint(&mut state).await?;
                    info!(status = %state.status, stages = state.history.len(), "Run finished");
                    return RunOutcome::from_state(&state).ok_or_else(|| {
                        OrchestratorError::Other(anyhow::anyhow!("terminal run has no outcome"))
                    });
                }
            }
        }
    }

    async fn execute(&self, stage: &str, context: &Context) -> Executed {
        let Some(def) = self.inner.registry.get(stage) else {
            return Executed::Failed(StageError::Handler {
                stage: stage.to_string(),
                source: anyhow::anyhow!("stage is not registered"),
            });
        };
        debug!(stage, "Executing stage");
        let run = def.handler.run(context);
        let result = match def.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(stage, timeout_ms = limit.as_millis() as u64, "Stage timed out");
                    Ok(StageOutput::new(outcome::TIMEOUT))
                }
            },
            None => run.await,
        };
        let output = match result {
            Ok(output) => output,
            Err(source) => {
                return Executed::Failed(StageError::Handler {
                    stage: stage.to_string(),
                    source,
                });
            }
        };
        if let Some(key) = output.delta.keys().find(|k| keys::is_reserved(k)) {
            return Executed::Failed(StageError::Handler {
                stage: stage.to_string(),
                source: anyhow::anyhow!("delta writes reserved key '{}'", key),
            });
        }
        if !def.declares(&output.outcome) {
            return Executed::Failed(StageError::UndeclaredOutcome {
                stage: stage.to_string(),
                outcome: output.outcome,
            });
        }
        Executed::Output(output)
    }

    /// Route and charge the retry budget of a revisited target.
    fn next_step(
        &self,
        state: &mut RunState,
        stage: &str,
        outcome: &str,
    ) -> std::result::Result<NextStep, StageError> {
        let next = self.inner.router.route(stage, outcome, &state.context)?;
        if let Some(target) = next.target()
            && state.has_executed(target)
        {
            let revisits = state.retry_count(target) + 1;
            self.inner.router.check_revisit(target, revisits)?;
            state.increment_retry(target);
        }
        Ok(next)
    }

    async fn fail(
        &self,
        state: &mut RunState,
        stage: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        err: StageError,
    ) -> Result<RunOutcome> {
        let message = err.to_string();
        warn!(stage, error = %message, "Stage failed; run is terminating");
        state.history.push(StageRecord {
            stage: stage.to_string(),
            started_at,
            ended_at,
            outcome: outcome::ERROR.to_string(),
            result: Value::Null,
            error: Some(message.clone()),
        });
        let seq = state.allocate_sequence();
        self.append(
            AuditEntry::new(&state.run_id, seq, AuditEventType::StageEnd)
                .with_stage(stage)
                .with_outcome(outcome::ERROR)
                .with_detail(message.clone()),
        )
        .await?;
        state.current_stage = None;
        state.status = RunStatus::Failed;
        state.error = Some(message.clone());
        self.checkpoint(state).await?;
        Ok(RunOutcome::Failed {
            run_id: state.run_id.clone(),
            stage: Some(stage.to_string()),
            error: message,
        })
    }
}

fn context_value(context: &Context) -> Value {
    Value::Object(context.clone().into_iter().collect())
}
