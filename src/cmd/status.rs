//! Read-only views: `status`, `list`, `routes`.

use anyhow::{Context, Result};
use breachgraph::orchestrator::Orchestrator;
use breachgraph::ui;
use breachgraph_common::{RunId, RunStatus};

pub async fn cmd_status(orchestrator: &Orchestrator, run_id: &str, json: bool) -> Result<()> {
    let state = orchestrator.status(&RunId::from(run_id)).await?;
    if json {
        let rendered =
            serde_json::to_string_pretty(&state).context("Failed to serialize run state")?;
        println!("{}", rendered);
    } else {
        ui::print_run(&state);
    }
    Ok(())
}

pub async fn cmd_list(orchestrator: &Orchestrator, status: Option<&str>) -> Result<()> {
    let filter: Option<RunStatus> = status.map(str::parse::<RunStatus>).transpose()?;
    let runs: Vec<_> = orchestrator
        .list()
        .await?
        .into_iter()
        .filter(|run| filter.is_none_or(|s| run.status == s))
        .collect();
    ui::print_runs(&runs);
    Ok(())
}

pub fn cmd_routes(orchestrator: &Orchestrator) -> Result<()> {
    ui::print_routes(orchestrator.router().table(), orchestrator.registry());
    Ok(())
}
