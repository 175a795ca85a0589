//! The standard attack-surface pipeline.
//!
//! ```text
//! enumerate -> ingest -> translate -> execute_query -> correlate
//!     ^                      ^             |               |
//!     |                      +-query_error-+      findings | no_findings
//!     +----------------- validation_failed ---------------+|
//!                                          pause before review -> remediate -> report
//!                                                        \-- reject --------/
//! ```
//!
//! Each stage wraps one external collaborator behind an async trait so the
//! demo backend in [`demo`] can be swapped for real cloud, graph and language
//! services without touching routing.

use async_trait::async_trait;
use breachgraph_common::NextStep;
use breachgraph_common::keys::outcome;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ConfigurationError;
use crate::orchestrator::RoutingTable;
use crate::stage::{ApprovalGate, StageDefinition, StageRegistry};
use crate::workflow_config::WorkflowToml;

pub mod demo;
pub mod guard;
pub mod stages;

pub use guard::{GuardViolation, QueryGuard};

pub const ENUMERATE: &str = "enumerate";
pub const INGEST: &str = "ingest";
pub const TRANSLATE: &str = "translate";
pub const EXECUTE_QUERY: &str = "execute_query";
pub const CORRELATE: &str = "correlate";
pub const REVIEW: &str = "review";
pub const REMEDIATE: &str = "remediate";
pub const REPORT: &str = "report";

/// Every stage of the standard pipeline, in nominal execution order.
pub const STAGES: [&str; 8] = [
    ENUMERATE,
    INGEST,
    TRANSLATE,
    EXECUTE_QUERY,
    CORRELATE,
    REVIEW,
    REMEDIATE,
    REPORT,
];

pub const REVIEW_PROMPT: &str = "approve remediation?";
pub const REVIEW_CHOICES: [&str; 2] = [outcome::APPROVE, outcome::REJECT];

/// Applied to `execute_query` when no configured timeout covers it.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// One discovered cloud resource, keyed by its natural identifier
/// (ARN, instance id, bucket name, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFact {
    pub label: String,
    pub id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RelationshipFact>,
}

impl ResourceFact {
    pub fn new(label: &str, id: &str) -> Self {
        Self {
            label: label.to_string(),
            id: id.to_string(),
            properties: Map::new(),
            relationships: Vec::new(),
        }
    }

    pub fn prop(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn rel(mut self, rel_type: &str, target_label: &str, target_id: &str) -> Self {
        self.relationships.push(RelationshipFact {
            rel_type: rel_type.to_string(),
            target_label: target_label.to_string(),
            target_id: target_id.to_string(),
            properties: Map::new(),
        });
        self
    }

    pub fn rel_with(
        mut self,
        rel_type: &str,
        target_label: &str,
        target_id: &str,
        properties: Value,
    ) -> Self {
        let properties = match properties {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.relationships.push(RelationshipFact {
            rel_type: rel_type.to_string(),
            target_label: target_label.to_string(),
            target_id: target_id.to_string(),
            properties,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipFact {
    pub rel_type: String,
    pub target_label: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Counts written to `ingestion_summary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSummary {
    /// Nodes present after ingestion.
    pub nodes: usize,
    /// Relationships present after ingestion.
    pub edges: usize,
    pub nodes_created: usize,
    pub edges_created: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathNode {
    pub label: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathEdge {
    pub rel_type: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// One result row: alternating nodes and edges, `edges.len() == nodes.len() - 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphPath {
    pub nodes: Vec<PathNode>,
    pub edges: Vec<PathEdge>,
    /// Properties of each node, parallel to `nodes`.
    #[serde(default)]
    pub node_properties: Vec<Map<String, Value>>,
}

impl GraphPath {
    pub fn is_well_formed(&self) -> bool {
        !self.nodes.is_empty() && self.edges.len() + 1 == self.nodes.len()
    }

    pub fn display(&self) -> String {
        let mut out = String::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                let rel = self.edges.get(i - 1).map_or("?", |e| e.rel_type.as_str());
                out.push_str(&format!(" -[{}]-> ", rel));
            }
            out.push_str(&format!("{}({})", node.label, node.id));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Self::Critical,
            70..=89 => Self::High,
            40..=69 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub score: u32,
    pub title: String,
    pub path: GraphPath,
}

/// What the correlator made of the query results.
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    /// Ranked findings, possibly empty. `ranking` lists finding ids, worst first.
    Ranked {
        findings: Vec<Finding>,
        ranking: Vec<String>,
    },
    /// Results do not describe the graph consistently; re-enumerate.
    Invalid { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub finding_id: String,
    pub target: String,
    pub action: String,
}

/// Discovers cloud resources. Parallel calls are the implementation's business.
#[async_trait]
pub trait Enumerator: Send + Sync {
    async fn enumerate(&self) -> anyhow::Result<Vec<ResourceFact>>;
}

/// Upsert-only property-graph writes. Ingesting the same facts twice must
/// not create duplicates.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert(&self, facts: &[ResourceFact]) -> anyhow::Result<IngestionSummary>;
}

/// Natural language to graph query. `Ok(None)` means the question cannot be
/// expressed against the schema.
#[async_trait]
pub trait QueryTranslator: Send + Sync {
    async fn translate(&self, question: &str, deep_analysis: bool)
    -> anyhow::Result<Option<String>>;
}

/// Runs a guarded read-only query. Errors are reported as `query_error`.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str) -> anyhow::Result<Vec<GraphPath>>;
}

#[async_trait]
pub trait Correlator: Send + Sync {
    async fn correlate(&self, results: &[GraphPath]) -> anyhow::Result<Correlation>;
}

#[async_trait]
pub trait RemediationPlanner: Send + Sync {
    async fn plan(&self, findings: &[Finding]) -> anyhow::Result<Vec<RemediationAction>>;
}

/// Renders a report and returns a reference to the artifact.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn render(&self, report: &Value) -> anyhow::Result<String>;
}

/// External services the pipeline stages wrap.
#[derive(Clone)]
pub struct Collaborators {
    pub enumerator: Arc<dyn Enumerator>,
    pub graph: Arc<dyn GraphStore>,
    pub translator: Arc<dyn QueryTranslator>,
    pub executor: Arc<dyn QueryExecutor>,
    pub correlator: Arc<dyn Correlator>,
    pub planner: Arc<dyn RemediationPlanner>,
    pub reporter: Arc<dyn Reporter>,
}

impl Collaborators {
    /// Demo backend: static sample cloud and a JSON-file property graph
    /// under `state_dir`, reports written to `reports_dir`.
    pub fn demo(state_dir: &Path, reports_dir: &Path) -> anyhow::Result<Self> {
        let graph = Arc::new(demo::InMemoryGraph::persistent(
            &state_dir.join(demo::GRAPH_FILE),
        )?);
        Ok(Self {
            enumerator: Arc::new(demo::DemoCloud),
            graph: graph.clone(),
            translator: Arc::new(demo::KeywordTranslator),
            executor: graph,
            correlator: Arc::new(demo::SeverityCorrelator),
            planner: Arc::new(demo::EdgeRemediationPlanner),
            reporter: Arc::new(demo::JsonReportWriter::new(reports_dir)),
        })
    }

    /// Demo backend with nothing persisted except reports.
    pub fn in_memory(reports_dir: &Path) -> Self {
        let graph = Arc::new(demo::InMemoryGraph::new());
        Self {
            enumerator: Arc::new(demo::DemoCloud),
            graph: graph.clone(),
            translator: Arc::new(demo::KeywordTranslator),
            executor: graph,
            correlator: Arc::new(demo::SeverityCorrelator),
            planner: Arc::new(demo::EdgeRemediationPlanner),
            reporter: Arc::new(demo::JsonReportWriter::new(reports_dir)),
        }
    }
}

/// Register every pipeline stage with limits resolved from `config`.
pub fn standard_registry(
    collaborators: &Collaborators,
    config: &WorkflowToml,
) -> Result<StageRegistry, ConfigurationError> {
    let limited = |def: StageDefinition| {
        let settings = config.stage_settings(&def.name);
        let timeout = settings.timeout.or(def.timeout);
        def.with_max_retries(settings.max_retries).with_timeout(timeout)
    };

    let mut registry = StageRegistry::new(ENUMERATE);
    registry.register(limited(StageDefinition::new(
        ENUMERATE,
        Arc::new(stages::EnumerateStage::new(collaborators.enumerator.clone())),
        &[outcome::OK, outcome::RETRY],
    )))?;
    registry.register(limited(StageDefinition::new(
        INGEST,
        Arc::new(stages::IngestStage::new(collaborators.graph.clone())),
        &[outcome::OK],
    )))?;
    registry.register(limited(StageDefinition::new(
        TRANSLATE,
        Arc::new(stages::TranslateStage::new(
            collaborators.translator.clone(),
            QueryGuard::default(),
        )),
        &[outcome::OK, outcome::TRANSLATION_ERROR],
    )))?;
    registry.register(limited(
        StageDefinition::new(
            EXECUTE_QUERY,
            Arc::new(stages::ExecuteQueryStage::new(collaborators.executor.clone())),
            &[outcome::OK, outcome::QUERY_ERROR, outcome::TIMEOUT],
        )
        .with_timeout(Some(DEFAULT_QUERY_TIMEOUT)),
    ))?;
    registry.register(limited(StageDefinition::new(
        CORRELATE,
        Arc::new(stages::CorrelateStage::new(collaborators.correlator.clone())),
        &[
            outcome::FINDINGS,
            outcome::NO_FINDINGS,
            outcome::VALIDATION_FAILED,
        ],
    )))?;
    // The gate waits on a human; it never times out.
    let mut review = ApprovalGate::new(REVIEW, &REVIEW_CHOICES).definition();
    review.max_retries = config.stage_settings(REVIEW).max_retries;
    registry.register(review)?;
    registry.register(limited(StageDefinition::new(
        REMEDIATE,
        Arc::new(stages::RemediateStage::new(collaborators.planner.clone())),
        &[outcome::OK],
    )))?;
    registry.register(limited(StageDefinition::new(
        REPORT,
        Arc::new(stages::ReportStage::new(collaborators.reporter.clone())),
        &[outcome::OK],
    )))?;
    Ok(registry)
}

/// Routing table for the standard pipeline.
///
/// Every stage except the approval gate retries itself on `timeout`, so a
/// configured stage timeout never leaves a declared outcome unrouted.
pub fn standard_routes() -> RoutingTable {
    let mut table = RoutingTable::new()
        .route(ENUMERATE, outcome::OK, NextStep::stage(INGEST))
        .route(ENUMERATE, outcome::RETRY, NextStep::stage(ENUMERATE))
        .route(INGEST, outcome::OK, NextStep::stage(TRANSLATE))
        .route(TRANSLATE, outcome::OK, NextStep::stage(EXECUTE_QUERY))
        .route(TRANSLATE, outcome::TRANSLATION_ERROR, NextStep::failed())
        .route(EXECUTE_QUERY, outcome::OK, NextStep::stage(CORRELATE))
        .route(EXECUTE_QUERY, outcome::QUERY_ERROR, NextStep::stage(TRANSLATE))
        .route(
            CORRELATE,
            outcome::FINDINGS,
            NextStep::pause(REVIEW, REVIEW_PROMPT, &REVIEW_CHOICES),
        )
        .route(CORRELATE, outcome::NO_FINDINGS, NextStep::stage(REPORT))
        .route(CORRELATE, outcome::VALIDATION_FAILED, NextStep::stage(ENUMERATE))
        .route(REVIEW, outcome::APPROVE, NextStep::stage(REMEDIATE))
        .route(REVIEW, outcome::REJECT, NextStep::stage(REPORT))
        .route(REMEDIATE, outcome::OK, NextStep::stage(REPORT))
        .route(REPORT, outcome::OK, NextStep::completed());
    for stage in STAGES.into_iter().filter(|s| *s != REVIEW) {
        table.insert(stage, outcome::TIMEOUT, NextStep::stage(stage));
    }
    table
}
