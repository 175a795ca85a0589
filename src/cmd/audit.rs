//! `audit show` / `audit export`.

use anyhow::{Context, Result};
use breachgraph::orchestrator::Orchestrator;
use breachgraph::ui;
use breachgraph_common::RunId;

use super::super::AuditCommands;

pub async fn cmd_audit(orchestrator: &Orchestrator, command: &AuditCommands) -> Result<()> {
    match command {
        AuditCommands::Show { run_id } => {
            let entries = orchestrator.audit_trail(&RunId::from(run_id.as_str())).await?;
            ui::print_audit(&entries);
        }
        AuditCommands::Export { run_id, output } => {
            let run_id = RunId::from(run_id.as_str());
            // Unknown runs are an error rather than an empty export.
            orchestrator.status(&run_id).await?;
            let entries = orchestrator.audit_trail(&run_id).await?;
            let json =
                serde_json::to_string_pretty(&entries).context("Failed to serialize audit trail")?;
            std::fs::write(output, json)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!(
                "Exported {} audit entries for {} to {}",
                entries.len(),
                run_id,
                output.display()
            );
        }
    }
    Ok(())
}
