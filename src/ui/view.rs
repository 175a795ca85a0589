//! Plain terminal rendering of runs, histories, audit trails and routes.

use breachgraph_common::keys;
use breachgraph_common::{AuditEntry, RunState, RunStatus, RunSummary, StageRecord};
use console::style;

use crate::orchestrator::{RoutingTable, RunOutcome};
use crate::pipeline::Finding;
use crate::stage::StageRegistry;
use crate::ui::icons::{CHECK, CLOCK, CROSS, PAUSED, REPORT, RUNNING, SHIELD, STOPPED};

pub fn status_label(status: RunStatus) -> String {
    let s = status.as_str();
    match status {
        RunStatus::Running => style(s).cyan().to_string(),
        RunStatus::Paused => style(s).yellow().to_string(),
        RunStatus::Completed => style(s).green().to_string(),
        RunStatus::Failed => style(s).red().bold().to_string(),
        RunStatus::Cancelled => style(s).dim().to_string(),
    }
}

pub fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Paused { run_id, approval } => {
            println!(
                "{}Run {} paused before {}: {} [{}]",
                PAUSED,
                run_id,
                style(&approval.decision_point).yellow(),
                approval.prompt,
                approval.choices.join("|")
            );
            println!(
                "  {}",
                style(format!("breachgraph resume {} <decision>", run_id)).dim()
            );
        }
        RunOutcome::Completed { run_id } => {
            println!("{}Run {} {}", CHECK, run_id, style("completed").green().bold());
        }
        RunOutcome::Failed {
            run_id,
            stage,
            error,
        } => {
            println!(
                "{}Run {} {} at {}: {}",
                CROSS,
                run_id,
                style("failed").red().bold(),
                style(stage.as_deref().unwrap_or("-")).yellow(),
                error
            );
        }
        RunOutcome::Cancelled { run_id } => {
            println!("{}Run {} {}", STOPPED, run_id, style("cancelled").dim());
        }
    }
}

pub fn history_line(index: usize, record: &StageRecord) -> String {
    let outcome = if record.is_error() {
        style(&record.outcome).red().to_string()
    } else {
        style(&record.outcome).green().to_string()
    };
    let mut line = format!(
        "{:>3}. {:<16} {:<20} {:>7}ms",
        index + 1,
        record.stage,
        outcome,
        record.duration_ms()
    );
    if let Some(error) = &record.error {
        line.push_str(&format!("  {}", style(error).red()));
    }
    line
}

pub fn print_run(state: &RunState) {
    println!();
    println!("Run:      {}", state.run_id);
    println!("Status:   {}", status_label(state.status));
    println!(
        "Stage:    {}",
        state.current_stage.as_deref().unwrap_or("-")
    );
    println!("Version:  {}", state.version);
    println!("Updated:  {}", state.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(approval) = &state.pending_approval {
        println!(
            "Waiting:  {}{} [{}]",
            PAUSED,
            approval.prompt,
            approval.choices.join("|")
        );
    }
    if let Some(error) = &state.error {
        println!("Error:    {}", style(error).red());
    }

    println!();
    if state.history.is_empty() {
        println!("No stages executed yet.");
    } else {
        println!("History:");
        for (i, record) in state.history.iter().enumerate() {
            println!("  {}", history_line(i, record));
        }
    }

    print_findings(state);
    println!();
}

fn print_findings(state: &RunState) {
    let findings: Vec<Finding> = state
        .context
        .get(keys::FINDINGS)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    if !findings.is_empty() {
        println!();
        println!("Findings:");
        for finding in &findings {
            println!(
                "  {}{} {:<8} {}",
                SHIELD,
                style(&finding.id).bold(),
                finding.severity,
                finding.title
            );
            println!("      {}", style(finding.path.display()).dim());
        }
    }
    if let Some(artifact) = state.context.get(keys::REPORT_ARTIFACT).and_then(|v| v.as_str()) {
        println!();
        println!("{}Report: {}", REPORT, artifact);
    }
}

pub fn print_runs(runs: &[RunSummary]) {
    println!();
    if runs.is_empty() {
        println!("No runs found. Start one with 'breachgraph start'.");
        println!();
        return;
    }
    println!(
        "{:<38} {:<10} {:<15} {:>7} {:>6}  Updated",
        "Run", "Status", "Stage", "Version", "Stages"
    );
    for run in runs {
        println!(
            "{:<38} {:<10} {:<15} {:>7} {:>6}  {}",
            run.run_id.as_str(),
            run.status.as_str(),
            run.current_stage.as_deref().unwrap_or("-"),
            run.version,
            run.stages_completed,
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
}

pub fn audit_line(entry: &AuditEntry) -> String {
    let mut line = format!(
        "{:>4} {} {:<14} {:<14} {:<18}",
        entry.sequence,
        entry.timestamp.format("%H:%M:%S%.3f"),
        entry.event_type.as_str(),
        entry.stage.as_deref().unwrap_or("-"),
        entry.outcome.as_deref().unwrap_or("-"),
    );
    if let Some(summary) = &entry.summary {
        line.push_str(&format!(
            " {}B sha256:{}",
            summary.bytes,
            &summary.digest[..summary.digest.len().min(12)]
        ));
    }
    if let Some(detail) = &entry.detail {
        line.push_str(&format!(" {}", detail));
    }
    line
}

pub fn print_audit(entries: &[AuditEntry]) {
    println!();
    if entries.is_empty() {
        println!("No audit entries recorded.");
        println!();
        return;
    }
    println!("{}Audit trail for {}", CLOCK, entries[0].run_id);
    println!();
    for entry in entries {
        println!("  {}", audit_line(entry));
    }
    println!();
}

pub fn route_lines(table: &RoutingTable) -> Vec<String> {
    table
        .entries()
        .map(|(stage, outcome, next)| format!("{:<16} {:<18} {}", stage, outcome, next))
        .collect()
}

pub fn print_routes(table: &RoutingTable, registry: &StageRegistry) {
    println!();
    println!("{}Entry stage: {}", RUNNING, style(registry.entry()).cyan());
    println!();
    println!("{:<16} {:<12} {:<10} Outcomes", "Stage", "Max retries", "Timeout");
    for def in registry.stages() {
        let timeout = def
            .timeout
            .map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<12} {:<10} {}",
            def.name,
            def.max_retries,
            timeout,
            def.declared_outcomes().join(", ")
        );
    }
    println!();
    println!("Routes:");
    for line in route_lines(table) {
        println!("  {}", line);
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use breachgraph_common::{AuditEventType, NextStep, RunId};
    use chrono::Utc;
    use serde_json::Value;

    #[test]
    fn audit_line_shows_sequence_and_detail() {
        let entry = AuditEntry::new(&RunId::from("r1"), 7, AuditEventType::RouteDecision)
            .with_stage("correlate")
            .with_outcome("findings")
            .with_detail("pause before review");
        let line = audit_line(&entry);
        assert!(line.contains("   7"));
        assert!(line.contains("route_decision"));
        assert!(line.ends_with("pause before review"));
    }

    #[test]
    fn history_line_includes_error() {
        let now = Utc::now();
        let record = StageRecord {
            stage: "ingest".into(),
            started_at: now,
            ended_at: now,
            outcome: "error".into(),
            result: Value::Null,
            error: Some("graph unavailable".into()),
        };
        let line = history_line(0, &record);
        assert!(line.contains("1. ingest"));
        assert!(line.contains("graph unavailable"));
    }

    #[test]
    fn route_lines_follow_table_order() {
        let table = RoutingTable::new()
            .route("b", "ok", NextStep::completed())
            .route("a", "ok", NextStep::stage("b"));
        let lines = route_lines(&table);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("a"));
        assert!(lines[0].ends_with("-> b"));
        assert!(lines[1].ends_with("completed"));
    }
}
