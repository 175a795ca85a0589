//! Stage handlers wrapping the pipeline collaborators.
//!
//! Handlers only read from the context they are given and only report
//! through their [`StageOutput`]; all persistence is the orchestrator's.

use anyhow::Context as _;
use async_trait::async_trait;
use breachgraph_common::Context;
use breachgraph_common::keys::{self, outcome};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use super::{
    Correlation, Correlator, Enumerator, Finding, GraphPath, GraphStore, QueryExecutor,
    QueryGuard, QueryTranslator, RemediationPlanner, Reporter, ResourceFact,
};
use crate::stage::{StageHandler, StageOutput};

/// Deserialize a context key, treating absence as an error.
fn required<T: DeserializeOwned>(context: &Context, key: &str) -> anyhow::Result<T> {
    let value = context
        .get(key)
        .with_context(|| format!("context key '{}' is missing", key))?;
    serde_json::from_value(value.clone())
        .with_context(|| format!("context key '{}' has an unexpected shape", key))
}

fn optional<T: DeserializeOwned>(context: &Context, key: &str) -> anyhow::Result<Option<T>> {
    match context.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .with_context(|| format!("context key '{}' has an unexpected shape", key)),
    }
}

pub struct EnumerateStage {
    enumerator: Arc<dyn Enumerator>,
}

impl EnumerateStage {
    pub fn new(enumerator: Arc<dyn Enumerator>) -> Self {
        Self { enumerator }
    }
}

#[async_trait]
impl StageHandler for EnumerateStage {
    async fn run(&self, _context: &Context) -> anyhow::Result<StageOutput> {
        let resources = self.enumerator.enumerate().await?;
        if resources.is_empty() {
            // Nothing discovered is treated as a transient miss.
            return Ok(StageOutput::new(outcome::RETRY).with(keys::RESOURCES, json!([])));
        }
        debug!(count = resources.len(), "Enumerated resources");
        Ok(StageOutput::ok().with(keys::RESOURCES, serde_json::to_value(&resources)?))
    }
}

pub struct IngestStage {
    graph: Arc<dyn GraphStore>,
}

impl IngestStage {
    pub fn new(graph: Arc<dyn GraphStore>) -> Self {
        Self { graph }
    }
}

#[async_trait]
impl StageHandler for IngestStage {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let resources: Vec<ResourceFact> = required(context, keys::RESOURCES)?;
        let summary = self
            .graph
            .upsert(&resources)
            .await
            .context("graph ingestion failed")?;
        Ok(StageOutput::ok().with(keys::INGESTION_SUMMARY, serde_json::to_value(summary)?))
    }
}

pub struct TranslateStage {
    translator: Arc<dyn QueryTranslator>,
    guard: QueryGuard,
}

impl TranslateStage {
    pub fn new(translator: Arc<dyn QueryTranslator>, guard: QueryGuard) -> Self {
        Self { translator, guard }
    }
}

#[async_trait]
impl StageHandler for TranslateStage {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let question: String = required(context, keys::QUESTION)?;
        let deep = optional::<bool>(context, keys::DEEP_ANALYSIS)?.unwrap_or(false);

        let Some(query) = self.translator.translate(&question, deep).await? else {
            return Ok(StageOutput::new(outcome::TRANSLATION_ERROR).with(
                keys::TRANSLATION_ERROR,
                format!("No query can answer '{}' against the graph schema", question),
            ));
        };

        match self.guard.check(&query) {
            Ok(query) => Ok(StageOutput::ok()
                .with(keys::GENERATED_QUERY, query)
                .with(keys::TRANSLATION_ERROR, Value::Null)),
            Err(violation) => Ok(StageOutput::new(outcome::TRANSLATION_ERROR)
                .with(keys::TRANSLATION_ERROR, violation.to_string())),
        }
    }
}

pub struct ExecuteQueryStage {
    executor: Arc<dyn QueryExecutor>,
}

impl ExecuteQueryStage {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StageHandler for ExecuteQueryStage {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let query: String = required(context, keys::GENERATED_QUERY)?;
        match self.executor.execute(&query).await {
            Ok(paths) => Ok(StageOutput::ok()
                .with(keys::QUERY_RESULTS, serde_json::to_value(&paths)?)
                .with(keys::QUERY_ERROR, Value::Null)),
            Err(e) => Ok(StageOutput::new(outcome::QUERY_ERROR)
                .with(keys::QUERY_ERROR, format!("{:#}", e))),
        }
    }
}

pub struct CorrelateStage {
    correlator: Arc<dyn Correlator>,
}

impl CorrelateStage {
    pub fn new(correlator: Arc<dyn Correlator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl StageHandler for CorrelateStage {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let results: Vec<GraphPath> = match required(context, keys::QUERY_RESULTS) {
            Ok(results) => results,
            Err(e) => {
                return Ok(StageOutput::new(outcome::VALIDATION_FAILED)
                    .with(keys::FINDINGS, json!([]))
                    .with(keys::VALIDATION_ERROR, format!("{:#}", e)));
            }
        };

        match self.correlator.correlate(&results).await? {
            Correlation::Invalid { reason } => Ok(StageOutput::new(outcome::VALIDATION_FAILED)
                .with(keys::FINDINGS, json!([]))
                .with(keys::VALIDATION_ERROR, reason)),
            Correlation::Ranked { findings, ranking } => {
                let tag = if findings.is_empty() {
                    outcome::NO_FINDINGS
                } else {
                    outcome::FINDINGS
                };
                Ok(StageOutput::new(tag)
                    .with(keys::FINDINGS, serde_json::to_value(&findings)?)
                    .with(keys::RANKING, serde_json::to_value(&ranking)?))
            }
        }
    }
}

pub struct RemediateStage {
    planner: Arc<dyn RemediationPlanner>,
}

impl RemediateStage {
    pub fn new(planner: Arc<dyn RemediationPlanner>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl StageHandler for RemediateStage {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let findings: Vec<Finding> = required(context, keys::FINDINGS)?;
        let plan = self.planner.plan(&findings).await?;
        Ok(StageOutput::ok().with(keys::REMEDIATION_PLAN, serde_json::to_value(&plan)?))
    }
}

pub struct ReportStage {
    reporter: Arc<dyn Reporter>,
}

impl ReportStage {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self { reporter }
    }
}

#[async_trait]
impl StageHandler for ReportStage {
    async fn run(&self, context: &Context) -> anyhow::Result<StageOutput> {
        let pick = |key: &str| context.get(key).cloned().unwrap_or(Value::Null);
        let report = json!({
            "question": pick(keys::QUESTION),
            "query": pick(keys::GENERATED_QUERY),
            "ingestion": pick(keys::INGESTION_SUMMARY),
            "findings": pick(keys::FINDINGS),
            "ranking": pick(keys::RANKING),
            "decision": pick(keys::HUMAN_DECISION),
            "remediation_plan": pick(keys::REMEDIATION_PLAN),
        });
        let artifact = self.reporter.render(&report).await?;
        Ok(StageOutput::ok().with(keys::REPORT_ARTIFACT, artifact))
    }
}
