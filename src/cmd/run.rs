//! Run lifecycle commands: `start`, `advance`, `resume`, `cancel`.

use anyhow::{Context as _, Result, bail};
use breachgraph::config::Config;
use breachgraph::errors::OrchestratorError;
use breachgraph::gates::{DecisionGate, GateDecision};
use breachgraph::orchestrator::{Orchestrator, RunOutcome};
use breachgraph::ui::{self, RunProgress};
use breachgraph_common::{Context, RunId, keys};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Initial context for a new run: `--input` JSON, then `--question` and
/// `--deep-analysis`, then `[pipeline]` defaults for whatever is still unset.
/// Keys the orchestrator owns are dropped from `--input`.
pub fn build_input(
    config: &Config,
    question: Option<&str>,
    deep_analysis: bool,
    input: Option<&str>,
) -> Result<Context> {
    let mut context = match input {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).context("--input must be valid JSON")?;
            match value {
                Value::Object(map) => map.into_iter().collect(),
                other => bail!("--input must be a JSON object, got {}", other),
            }
        }
        None => Context::new(),
    };
    context.retain(|key, _| !keys::is_reserved(key));

    match question {
        Some(q) => {
            context.insert(keys::QUESTION.to_string(), Value::from(q));
        }
        None => {
            context
                .entry(keys::QUESTION.to_string())
                .or_insert_with(|| Value::from(config.workflow.pipeline.question.as_str()));
        }
    }
    if deep_analysis {
        context.insert(keys::DEEP_ANALYSIS.to_string(), Value::Bool(true));
    } else {
        context
            .entry(keys::DEEP_ANALYSIS.to_string())
            .or_insert(Value::Bool(config.workflow.pipeline.deep_analysis));
    }
    Ok(context)
}

pub async fn cmd_start(
    orchestrator: &Orchestrator,
    config: &Config,
    question: Option<&str>,
    deep_analysis: bool,
    input: Option<&str>,
    detach: bool,
) -> Result<()> {
    let input = build_input(config, question, deep_analysis, input)?;
    let run_id = orchestrator.create_run(input).await?;

    // Scripts capture the id from stdout; drive it later with `advance`.
    if detach {
        println!("{}", run_id);
        return Ok(());
    }

    println!("Started run {}", run_id);
    let outcome = with_progress(orchestrator, &run_id, config, orchestrator.advance(&run_id)).await?;
    settle(orchestrator, config, outcome).await
}

pub async fn cmd_advance(orchestrator: &Orchestrator, config: &Config, run_id: &str) -> Result<()> {
    let run_id = RunId::from(run_id);
    let outcome = with_progress(orchestrator, &run_id, config, orchestrator.advance(&run_id)).await?;
    settle(orchestrator, config, outcome).await
}

pub async fn cmd_resume(
    orchestrator: &Orchestrator,
    config: &Config,
    run_id: &str,
    decision: Option<&str>,
) -> Result<()> {
    let run_id = RunId::from(run_id);
    let decision = match decision {
        Some(decision) => decision.to_string(),
        None => {
            let state = orchestrator.status(&run_id).await?;
            let Some(approval) = state.pending_approval else {
                bail!(
                    "Run {} is not waiting for a decision (status: {})",
                    run_id,
                    state.status
                );
            };
            match DecisionGate::new(config.yes).decide(&approval)? {
                GateDecision::Choose(choice) => choice,
                GateDecision::Abort => {
                    println!("Run {} left paused.", run_id);
                    return Ok(());
                }
            }
        }
    };

    let outcome = with_progress(
        orchestrator,
        &run_id,
        config,
        orchestrator.resume(&run_id, &decision),
    )
    .await?;
    settle(orchestrator, config, outcome).await
}

pub async fn cmd_cancel(orchestrator: &Orchestrator, run_id: &str) -> Result<()> {
    let run_id = RunId::from(run_id);
    orchestrator.cancel(&run_id).await?;
    ui::print_outcome(&RunOutcome::Cancelled { run_id });
    Ok(())
}

/// Await `work` while a spinner shows the last checkpointed stage.
async fn with_progress<F>(
    orchestrator: &Orchestrator,
    run_id: &RunId,
    config: &Config,
    work: F,
) -> Result<RunOutcome>
where
    F: Future<Output = Result<RunOutcome, OrchestratorError>>,
{
    // Verbose logging goes to stderr too; keep the spinner out of its way.
    let progress = RunProgress::new(run_id.as_str(), config.verbose);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    tokio::pin!(work);

    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = ticker.tick() => {
                if let Ok(state) = orchestrator.status(run_id).await {
                    progress.update(state.current_stage.as_deref(), state.history.len());
                }
            }
        }
    };
    progress.finish();
    Ok(result?)
}

/// Print the outcome; with `--yes`, keep answering pauses with the first
/// offered choice. A failed run is a command failure.
async fn settle(orchestrator: &Orchestrator, config: &Config, mut outcome: RunOutcome) -> Result<()> {
    loop {
        ui::print_outcome(&outcome);
        let RunOutcome::Paused { run_id, approval } = &outcome else {
            break;
        };
        if !config.yes {
            break;
        }
        let GateDecision::Choose(decision) = DecisionGate::new(true).decide(approval)? else {
            break;
        };
        let run_id = run_id.clone();
        outcome = with_progress(
            orchestrator,
            &run_id,
            config,
            orchestrator.resume(&run_id, &decision),
        )
        .await?;
    }

    if let RunOutcome::Failed { run_id, stage, .. } = &outcome {
        bail!(
            "Run {} failed at stage {}",
            run_id,
            stage.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use breachgraph::workflow_config::WorkflowToml;
    use std::path::PathBuf;

    fn config() -> Config {
        Config::from_parts(PathBuf::from("/tmp/project"), WorkflowToml::default(), false, false)
    }

    #[test]
    fn defaults_fill_missing_question() {
        let input = build_input(&config(), None, false, None).unwrap();
        assert_eq!(input[keys::QUESTION], "show internet-reachable hosts");
        assert_eq!(input[keys::DEEP_ANALYSIS], false);
    }

    #[test]
    fn flags_override_input_json() {
        let input = build_input(
            &config(),
            Some("secrets?"),
            true,
            Some(r#"{"question": "ignored", "deep_analysis": false, "tenant": "acme"}"#),
        )
        .unwrap();
        assert_eq!(input[keys::QUESTION], "secrets?");
        assert_eq!(input[keys::DEEP_ANALYSIS], true);
        assert_eq!(input["tenant"], "acme");
    }

    #[test]
    fn input_json_question_beats_config_default() {
        let input = build_input(&config(), None, false, Some(r#"{"question": "roles"}"#)).unwrap();
        assert_eq!(input[keys::QUESTION], "roles");
    }

    #[test]
    fn reserved_keys_are_dropped_from_input() {
        let input = build_input(
            &config(),
            None,
            false,
            Some(r#"{"retry_counts": {"enumerate": 0}, "human_decision": "approve", "tenant": "acme"}"#),
        )
        .unwrap();
        assert!(!input.contains_key(keys::RETRY_COUNTS));
        assert!(!input.contains_key(keys::HUMAN_DECISION));
        assert_eq!(input["tenant"], "acme");
    }

    #[test]
    fn non_object_input_is_rejected() {
        assert!(build_input(&config(), None, false, Some("[1, 2]")).is_err());
        assert!(build_input(&config(), None, false, Some("{oops")).is_err());
    }
}
