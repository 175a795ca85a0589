//! Stage handlers and the registry that names them.
//!
//! A stage is a named unit of work: a handler, the outcome tags it may
//! return, an optional maximum duration and a retry budget. The registry also
//! designates the entry stage a fresh run starts at.

use async_trait::async_trait;
use breachgraph_common::keys::{self, outcome};
use breachgraph_common::Context;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigurationError;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What a handler returns: the context delta to merge and the outcome tag the
/// router consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub delta: Context,
    pub outcome: String,
}

impl StageOutput {
    pub fn new(outcome: &str) -> Self {
        Self {
            delta: Context::new(),
            outcome: outcome.to_string(),
        }
    }

    pub fn ok() -> Self {
        Self::new(outcome::OK)
    }

    /// Add a key to the delta.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.delta.insert(key.to_string(), value.into());
        self
    }
}

/// A stage's work. Handlers read only from `context`; an `Err` is an
/// unrecoverable failure that ends the run.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput>;
}

pub struct StageDefinition {
    pub name: String,
    pub handler: Arc<dyn StageHandler>,
    pub outcomes: Vec<String>,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
}

impl StageDefinition {
    pub fn new(name: &str, handler: Arc<dyn StageHandler>, outcomes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            handler,
            outcomes: outcomes.iter().map(|o| o.to_string()).collect(),
            timeout: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Outcome tags the router must cover. A declared timeout adds `timeout`.
    pub fn declared_outcomes(&self) -> Vec<&str> {
        let mut declared: Vec<&str> = self.outcomes.iter().map(String::as_str).collect();
        if self.timeout.is_some() && !declared.contains(&outcome::TIMEOUT) {
            declared.push(outcome::TIMEOUT);
        }
        declared
    }

    pub fn declares(&self, tag: &str) -> bool {
        self.declared_outcomes().contains(&tag)
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("outcomes", &self.outcomes)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

#[derive(Debug)]
pub struct StageRegistry {
    entry: String,
    stages: BTreeMap<String, StageDefinition>,
}

impl StageRegistry {
    pub fn new(entry: &str) -> Self {
        Self {
            entry: entry.to_string(),
            stages: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, definition: StageDefinition) -> Result<(), ConfigurationError> {
        if self.stages.contains_key(&definition.name) {
            return Err(ConfigurationError::DuplicateStage {
                stage: definition.name,
            });
        }
        self.stages.insert(definition.name.clone(), definition);
        Ok(())
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.values()
    }
}

/// Handler for a human breakpoint: the router pauses before this stage, and
/// once resumed it returns the recorded decision as its outcome.
pub struct ApprovalGate {
    stage: String,
    choices: Vec<String>,
}

impl ApprovalGate {
    pub fn new(stage: &str, choices: &[&str]) -> Self {
        Self {
            stage: stage.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Registry entry for this gate; its outcomes are the offered choices.
    pub fn definition(self) -> StageDefinition {
        let name = self.stage.clone();
        let choices = self.choices.clone();
        let mut def = StageDefinition::new(&name, Arc::new(self), &[]);
        def.outcomes = choices;
        def
    }
}

#[async_trait]
impl StageHandler for ApprovalGate {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let point = context
            .get(keys::HUMAN_DECISION_POINT)
            .and_then(Value::as_str);
        if point != Some(self.stage.as_str()) {
            anyhow::bail!(
                "No human decision recorded for '{}' (last decision point: {})",
                self.stage,
                point.unwrap_or("none")
            );
        }
        let decision = context
            .get(keys::HUMAN_DECISION)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Decision for '{}' is missing", self.stage))?;
        if !self.choices.iter().any(|c| c == decision) {
            anyhow::bail!("Decision '{}' is not valid for '{}'", decision, self.stage);
        }
        Ok(StageOutput::new(decision))
    }
}

/// Handler built from an async closure. Mostly for tests and small embeddings.
pub struct FnStage<F>(pub F);

#[async_trait]
impl<F, Fut> StageHandler for FnStage<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<StageOutput>> + Send,
{
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        (self.0)(context.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn StageHandler> {
        Arc::new(FnStage(|_ctx: Context| async { Ok::<_, anyhow::Error>(StageOutput::ok()) }))
    }

    #[test]
    fn duplicate_stage_is_rejected() {
        let mut registry = StageRegistry::new("a");
        registry
            .register(StageDefinition::new("a", noop(), &["ok"]))
            .unwrap();
        let err = registry
            .register(StageDefinition::new("a", noop(), &["ok"]))
            .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateStage { stage: "a".into() });
    }

    #[test]
    fn timeout_declares_timeout_outcome() {
        let def = StageDefinition::new("q", noop(), &["ok"]);
        assert!(!def.declares("timeout"));
        let def = def.with_timeout(Some(Duration::from_secs(1)));
        assert_eq!(def.declared_outcomes(), vec!["ok", "timeout"]);
    }

    #[test]
    fn explicit_timeout_outcome_is_not_duplicated() {
        let def = StageDefinition::new("q", noop(), &["ok", "timeout"])
            .with_timeout(Some(Duration::from_secs(1)));
        assert_eq!(def.declared_outcomes(), vec!["ok", "timeout"]);
    }

    #[tokio::test]
    async fn approval_gate_returns_decision() {
        let gate = ApprovalGate::new("review", &["approve", "reject"]);
        let mut ctx = Context::new();
        ctx.insert(keys::HUMAN_DECISION.into(), json!("reject"));
        ctx.insert(keys::HUMAN_DECISION_POINT.into(), json!("review"));
        let out = gate.run(&ctx).await.unwrap();
        assert_eq!(out.outcome, "reject");
        assert!(out.delta.is_empty());
    }

    #[tokio::test]
    async fn approval_gate_refuses_decision_for_other_stage() {
        let gate = ApprovalGate::new("review", &["approve", "reject"]);
        let mut ctx = Context::new();
        ctx.insert(keys::HUMAN_DECISION.into(), json!("approve"));
        ctx.insert(keys::HUMAN_DECISION_POINT.into(), json!("sign_off"));
        assert!(gate.run(&ctx).await.is_err());
    }

    #[test]
    fn gate_definition_declares_choices() {
        let def = ApprovalGate::new("review", &["approve", "reject"]).definition();
        assert_eq!(def.name, "review");
        assert_eq!(def.declared_outcomes(), vec!["approve", "reject"]);
    }

    #[test]
    fn output_builder_collects_delta() {
        let out = StageOutput::ok().with("resources", json!([1])).with("n", 1);
        assert_eq!(out.outcome, "ok");
        assert_eq!(out.delta.len(), 2);
    }
}
