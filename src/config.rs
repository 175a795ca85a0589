use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::workflow_config::{CONFIG_FILE, WorkflowToml};

pub const STATE_DIR: &str = ".breachgraph";

/// Runtime configuration: resolved paths plus the layered workflow settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// `.breachgraph/` under the project directory.
    pub state_dir: PathBuf,
    pub checkpoint_db: PathBuf,
    pub audit_dir: PathBuf,
    pub log_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub verbose: bool,
    pub yes: bool,
    pub workflow: WorkflowToml,
}

impl Config {
    /// Resolve `project_dir` and load file + environment settings.
    pub fn new(project_dir: &Path, verbose: bool, yes: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;
        let state_dir = project_dir.join(STATE_DIR);
        let mut workflow = WorkflowToml::load_or_default(&state_dir)?;
        workflow.apply_env(|key| std::env::var(key).ok())?;
        Ok(Self::from_parts(project_dir, workflow, verbose, yes))
    }

    /// Build from an already-loaded workflow config. Paths in `[storage]` are
    /// relative to `project_dir` unless absolute.
    pub fn from_parts(project_dir: PathBuf, workflow: WorkflowToml, verbose: bool, yes: bool) -> Self {
        let state_dir = project_dir.join(STATE_DIR);
        let checkpoint_db = project_dir.join(&workflow.storage.checkpoint_db);
        let audit_dir = project_dir.join(&workflow.storage.audit_dir);
        Self {
            log_dir: state_dir.join("logs"),
            reports_dir: state_dir.join("reports"),
            project_dir,
            state_dir,
            checkpoint_db,
            audit_dir,
            verbose,
            yes,
            workflow,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir).context("Failed to create state directory")?;
        std::fs::create_dir_all(&self.audit_dir).context("Failed to create audit directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        std::fs::create_dir_all(&self.reports_dir)
            .context("Failed to create reports directory")?;
        if let Some(parent) = self.checkpoint_db.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create checkpoint database directory")?;
        }
        Ok(())
    }

    /// Filter directive for the log subscriber when `RUST_LOG` is unset.
    pub fn log_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.workflow.logging.level
        }
    }
}
