use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use breachgraph::config::Config;
use breachgraph::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "breachgraph")]
#[command(version, about = "Checkpointed, resumable attack-surface graph analysis")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Answer every approval prompt with its first choice
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run and drive it until it pauses or terminates
    Start {
        /// Question to answer (defaults to [pipeline] question)
        #[arg(short, long)]
        question: Option<String>,

        /// Allow deeper graph traversals
        #[arg(long)]
        deep_analysis: bool,

        /// Initial context as a JSON object
        #[arg(long)]
        input: Option<String>,

        /// Only create the run and print its id; drive it later with `advance`
        #[arg(long)]
        detach: bool,
    },
    /// Drive a run from its last checkpoint
    #[command(alias = "run-to-completion")]
    Advance { run_id: String },
    /// Record a decision for a paused run and continue it
    Resume {
        run_id: String,
        /// One of the offered choices; prompts when omitted
        decision: Option<String>,
    },
    /// Cancel a run that has not terminated
    Cancel { run_id: String },
    /// Show a run's state, history and findings
    Status {
        run_id: String,
        /// Print the full checkpointed state as JSON
        #[arg(long)]
        json: bool,
    },
    /// List runs, most recently updated first
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<String>,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Show the stage registry and routing table
    Routes,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Print a run's audit trail
    Show { run_id: String },
    /// Write a run's audit trail as JSON
    Export { run_id: String, output: PathBuf },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default breachgraph.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(&project_dir, cli.verbose, cli.yes)?;

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config, command.clone());
    }

    config.ensure_directories()?;
    let _log_guard = init_logging(
        &config.log_dir,
        config.log_level(),
        config.workflow.logging.json_console,
    )?;
    let orchestrator = cmd::build_orchestrator(&config)?;

    match &cli.command {
        Commands::Start {
            question,
            deep_analysis,
            input,
            detach,
        } => {
            cmd::cmd_start(
                &orchestrator,
                &config,
                question.as_deref(),
                *deep_analysis,
                input.as_deref(),
                *detach,
            )
            .await?
        }
        Commands::Advance { run_id } => cmd::cmd_advance(&orchestrator, &config, run_id).await?,
        Commands::Resume { run_id, decision } => {
            cmd::cmd_resume(&orchestrator, &config, run_id, decision.as_deref()).await?
        }
        Commands::Cancel { run_id } => cmd::cmd_cancel(&orchestrator, run_id).await?,
        Commands::Status { run_id, json } => cmd::cmd_status(&orchestrator, run_id, *json).await?,
        Commands::List { status } => cmd::cmd_list(&orchestrator, status.as_deref()).await?,
        Commands::Audit { command } => cmd::cmd_audit(&orchestrator, command).await?,
        Commands::Routes => cmd::cmd_routes(&orchestrator)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
