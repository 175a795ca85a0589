//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                          |
//! |----------|-------------------------------------------|
//! | `run`    | `Start`, `Advance`, `Resume`, `Cancel`    |
//! | `status` | `Status`, `List`, `Routes`                |
//! | `audit`  | `Audit`                                   |
//! | `config` | `Config`                                  |

use anyhow::{Context, Result};
use std::sync::Arc;

use breachgraph::audit::JsonlAuditLog;
use breachgraph::checkpoint::SqliteCheckpointStore;
use breachgraph::config::Config;
use breachgraph::orchestrator::Orchestrator;
use breachgraph::pipeline::{Collaborators, standard_registry, standard_routes};

pub mod audit;
pub mod config;
pub mod run;
pub mod status;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use run::{cmd_advance, cmd_cancel, cmd_resume, cmd_start};
pub use status::{cmd_list, cmd_routes, cmd_status};

/// Wire the standard pipeline to the on-disk stores under the project's
/// state directory. Fails on an incomplete routing table.
pub fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    let store = SqliteCheckpointStore::open(&config.checkpoint_db).with_context(|| {
        format!(
            "Failed to open checkpoint database: {}",
            config.checkpoint_db.display()
        )
    })?;
    let audit = JsonlAuditLog::new(&config.audit_dir);
    let collaborators = Collaborators::demo(&config.state_dir, &config.reports_dir)?;
    let registry = standard_registry(&collaborators, &config.workflow)
        .context("Invalid stage registry")?;
    let orchestrator = Orchestrator::new(
        registry,
        standard_routes(),
        Arc::new(store),
        Arc::new(audit),
    )
    .context("Invalid routing table")?;
    Ok(orchestrator)
}
