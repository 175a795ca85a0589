//! Configuration view and validation commands: `breachgraph config`.

use anyhow::{Context, Result};
use breachgraph::config::Config;
use breachgraph::pipeline::STAGES;
use breachgraph::workflow_config::{WorkflowToml, default_config_template};

use super::super::ConfigCommands;

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("breachgraph configuration");
            println!("=========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No breachgraph.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values: file plus environment overrides
            let rendered = toml::to_string_pretty(&config.workflow)
                .context("Failed to render configuration")?;
            println!("{}", rendered.trim_end());
            println!();

            println!("Effective stage limits:");
            for stage in STAGES {
                let settings = config.workflow.stage_settings(stage);
                let timeout = settings
                    .timeout
                    .map(|t| format!("{}s", t.as_secs()))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<16} max_retries = {:<3} timeout = {}",
                    stage, settings.max_retries, timeout
                );
            }
            println!();
            println!("Checkpoints: {}", config.checkpoint_db.display());
            println!("Audit logs:  {}", config.audit_dir.display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No breachgraph.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = WorkflowToml::load(&config_path)?;
            let warnings = toml.validate(&STAGES);

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("breachgraph.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.state_dir)
                .context("Failed to create state directory")?;
            std::fs::write(&config_path, default_config_template())
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created breachgraph.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [defaults] max_retries, stage_timeout_secs");
            println!("  - [stages.overrides.\"pattern-*\"] for stage-specific limits");
            println!("  - [pipeline] default question and deep_analysis");
            println!();
        }
    }

    Ok(())
}
