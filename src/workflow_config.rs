//! Project configuration read from `.breachgraph/breachgraph.toml`.
//!
//! Layering is file, then environment, then CLI flags. A missing file is the
//! same as an empty one: every field has a default.
//!
//! ```toml
//! [storage]
//! checkpoint_db = ".breachgraph/checkpoints.db"
//! audit_dir = ".breachgraph/audit"
//!
//! [defaults]
//! max_retries = 3
//! stage_timeout_secs = 120
//!
//! [stages.overrides."execute_*"]
//! max_retries = 5
//! timeout_secs = 30
//!
//! [pipeline]
//! question = "show internet-reachable hosts"
//! deep_analysis = false
//!
//! [logging]
//! level = "info"
//! json_console = false
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::stage::DEFAULT_MAX_RETRIES;

pub const CONFIG_FILE: &str = "breachgraph.toml";
pub const ENV_MAX_RETRIES: &str = "BREACHGRAPH_MAX_RETRIES";
pub const ENV_STAGE_TIMEOUT_SECS: &str = "BREACHGRAPH_STAGE_TIMEOUT_SECS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSection {
    /// SQLite checkpoint database, relative to the project directory.
    #[serde(default = "default_checkpoint_db")]
    pub checkpoint_db: String,
    /// Directory holding one `<run_id>.jsonl` audit file per run.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: String,
}

fn default_checkpoint_db() -> String {
    ".breachgraph/checkpoints.db".to_string()
}

fn default_audit_dir() -> String {
    ".breachgraph/audit".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            checkpoint_db: default_checkpoint_db(),
            audit_dir: default_audit_dir(),
        }
    }
}

/// Limits applied to every stage unless an override matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stage_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Glob pattern (e.g. "execute_*") -> override
    #[serde(default)]
    pub overrides: BTreeMap<String, StageOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Question used when `start` is given none.
    #[serde(default = "default_question")]
    pub question: String,
    #[serde(default)]
    pub deep_analysis: bool,
}

fn default_question() -> String {
    "show internet-reachable hosts".to_string()
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            question: default_question(),
            deep_analysis: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json_console: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_console: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowToml {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub stages: StagesConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Effective limits for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSettings {
    pub max_retries: u32,
    pub timeout: Option<Duration>,
}

impl WorkflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse breachgraph.toml")
    }

    /// Load `<state_dir>/breachgraph.toml`, or defaults if it does not exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply environment overrides to `[defaults]`. `lookup` is usually
    /// `std::env::var(..).ok()`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.defaults.max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("{} must be a non-negative integer, got '{}'", ENV_MAX_RETRIES, raw))?;
        }
        if let Some(raw) = lookup(ENV_STAGE_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().with_context(|| {
                format!("{} must be a number of seconds, got '{}'", ENV_STAGE_TIMEOUT_SECS, raw)
            })?;
            self.defaults.stage_timeout_secs = (secs > 0).then_some(secs);
        }
        Ok(())
    }

    /// Limits for `stage`: defaults, then every matching override from the
    /// least to the most specific (longest) pattern.
    pub fn stage_settings(&self, stage: &str) -> StageSettings {
        let mut settings = StageSettings {
            max_retries: self.defaults.max_retries,
            timeout: self.defaults.stage_timeout_secs.map(Duration::from_secs),
        };

        let mut matching: Vec<(&String, &StageOverride)> = self
            .stages
            .overrides
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, stage))
            .collect();
        matching.sort_by_key(|(pattern, _)| pattern.len());

        for (_, override_cfg) in matching {
            if let Some(max) = override_cfg.max_retries {
                settings.max_retries = max;
            }
            if let Some(secs) = override_cfg.timeout_secs {
                settings.timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
        }
        settings
    }

    /// Problems worth reporting. `known_stages` are the registered stage names.
    pub fn validate(&self, known_stages: &[&str]) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.max_retries == 0 {
            warnings.push(
                "defaults.max_retries is 0: any stage revisit will fail the run".to_string(),
            );
        }
        if self.defaults.stage_timeout_secs == Some(0) {
            warnings.push("defaults.stage_timeout_secs is 0 and will be ignored".to_string());
        }

        for (pattern, override_cfg) in &self.stages.overrides {
            if glob::Pattern::new(pattern).is_err() {
                warnings.push(format!("Invalid stage pattern '{}'", pattern));
                continue;
            }
            if !known_stages.iter().any(|s| pattern_matches(pattern, s)) {
                warnings.push(format!("Stage pattern '{}' matches no registered stage", pattern));
            }
            if override_cfg.max_retries == Some(0) {
                warnings.push(format!(
                    "Override '{}' sets max_retries = 0: any revisit will fail the run",
                    pattern
                ));
            }
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!("Invalid logging.level '{}'", self.logging.level));
        }

        warnings
    }
}

/// Case-insensitive glob match of a stage name.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(&pattern.to_lowercase())
        .map(|p| p.matches(&name.to_lowercase()))
        .unwrap_or(false)
}

/// Commented starter file written by `config init`.
pub fn default_config_template() -> String {
    format!(
        r#"# breachgraph workflow configuration

[storage]
checkpoint_db = "{db}"
audit_dir = "{audit}"

[defaults]
max_retries = {retries}
# stage_timeout_secs = 120

# [stages.overrides."execute_*"]
# max_retries = 5
# timeout_secs = 30

[pipeline]
question = "{question}"
deep_analysis = false

[logging]
level = "info"
json_console = false
"#,
        db = default_checkpoint_db(),
        audit = default_audit_dir(),
        retries = DEFAULT_MAX_RETRIES,
        question = default_question(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = WorkflowToml::parse("").unwrap();
        assert_eq!(cfg, WorkflowToml::default());
        assert_eq!(cfg.defaults.max_retries, 3);
        assert_eq!(cfg.storage.audit_dir, ".breachgraph/audit");
    }

    #[test]
    fn template_parses_to_defaults() {
        let cfg = WorkflowToml::parse(&default_config_template()).unwrap();
        assert_eq!(cfg, WorkflowToml::default());
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempdir().unwrap();
        let cfg = WorkflowToml::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg, WorkflowToml::default());
    }

    #[test]
    fn longest_matching_pattern_wins() {
        let cfg = WorkflowToml::parse(
            r#"
            [defaults]
            max_retries = 2
            stage_timeout_secs = 60

            [stages.overrides."*"]
            max_retries = 4

            [stages.overrides."execute_*"]
            max_retries = 6
            timeout_secs = 5
            "#,
        )
        .unwrap();

        let exec = cfg.stage_settings("execute_query");
        assert_eq!(exec.max_retries, 6);
        assert_eq!(exec.timeout, Some(Duration::from_secs(5)));

        let ingest = cfg.stage_settings("ingest");
        assert_eq!(ingest.max_retries, 4);
        assert_eq!(ingest.timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn env_overrides_file_defaults() {
        let mut cfg = WorkflowToml::parse("[defaults]\nmax_retries = 2\n").unwrap();
        let env: HashMap<&str, &str> =
            HashMap::from([(ENV_MAX_RETRIES, "7"), (ENV_STAGE_TIMEOUT_SECS, "15")]);
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.defaults.max_retries, 7);
        assert_eq!(
            cfg.stage_settings("ingest").timeout,
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn malformed_env_value_is_an_error() {
        let mut cfg = WorkflowToml::default();
        let err = cfg
            .apply_env(|k| (k == ENV_MAX_RETRIES).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_RETRIES));
    }

    #[test]
    fn validate_flags_dead_patterns_and_zero_retries() {
        let cfg = WorkflowToml::parse(
            r#"
            [stages.overrides."analyze*"]
            max_retries = 0
            "#,
        )
        .unwrap();
        let warnings = cfg.validate(&["enumerate", "ingest"]);
        assert!(warnings.iter().any(|w| w.contains("matches no registered stage")));
        assert!(warnings.iter().any(|w| w.contains("max_retries = 0")));
    }

    #[test]
    fn pattern_matching_is_case_insensitive() {
        assert!(pattern_matches("EXECUTE_*", "execute_query"));
        assert!(pattern_matches("?ngest", "ingest"));
        assert!(!pattern_matches("report", "remediate"));
    }
}
