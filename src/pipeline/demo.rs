//! Self-contained collaborators for demos and tests.
//!
//! The sample account mirrors a small AWS estate: a public web instance behind
//! an open security group whose instance profile is an admin role that can
//! read a bucket holding a production secret.

use anyhow::{Context as _, bail};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};
use tracing::debug;

use super::{
    Correlation, Correlator, Enumerator, Finding, GraphPath, GraphStore, IngestionSummary,
    PathEdge, PathNode, QueryExecutor, QueryTranslator, RemediationAction, RemediationPlanner,
    Reporter, ResourceFact, Severity,
};

pub const GRAPH_FILE: &str = "graph.json";

const ACCOUNT_ID: &str = "111111111111";
const INTERNET: &str = "0.0.0.0/0";
const ALICE: &str = "arn:aws:iam::111111111111:user/alice";
const BOB: &str = "arn:aws:iam::111111111111:user/bob";
const ADMIN_ROLE: &str = "arn:aws:iam::111111111111:role/AdminRole";
const SSM_ROLE: &str = "arn:aws:iam::111111111111:role/SSMRole";
const READ_BUCKET_ROLE: &str = "arn:aws:iam::111111111111:role/ReadBucketRole";
const FRONTEND: &str = "i-0demo12345";
const BACKEND: &str = "i-0demo67890";
const WEB_SG: &str = "sg-0web";

/// Static sample cloud.
pub struct DemoCloud;

impl DemoCloud {
    pub fn resources() -> Vec<ResourceFact> {
        let in_account = |fact: ResourceFact| fact.rel("IN_ACCOUNT", "Account", ACCOUNT_ID);
        vec![
            ResourceFact::new("Account", ACCOUNT_ID)
                .prop("name", "demo-account")
                .prop("env", "dev"),
            ResourceFact::new("Internet", INTERNET)
                .prop("cidr", INTERNET)
                .rel_with(
                    "CAN_REACH",
                    "SecurityGroup",
                    WEB_SG,
                    json!({"fromPort": 443, "toPort": 443, "proto": "tcp"}),
                ),
            in_account(
                ResourceFact::new("SecurityGroup", WEB_SG)
                    .prop("groupName", "web-public")
                    .rel("ATTACHED_TO", "EC2Instance", FRONTEND),
            ),
            in_account(
                ResourceFact::new("IAMUser", ALICE)
                    .prop("userName", "alice")
                    .prop("mfaEnabled", true)
                    .prop("riskTier", "medium")
                    .rel_with("CAN_ASSUME", "IAMRole", ADMIN_ROLE, json!({"condition": "MFA"})),
            ),
            in_account(
                ResourceFact::new("IAMUser", BOB)
                    .prop("userName", "bob")
                    .prop("mfaEnabled", false)
                    .prop("riskTier", "high"),
            ),
            in_account(
                ResourceFact::new("IAMRole", ADMIN_ROLE)
                    .prop("roleName", "AdminRole")
                    .prop("isPrivileged", true)
                    .rel("HAS_POLICY", "IAMPolicy", "AdministratorAccess")
                    .rel("CAN_SSM", "EC2Instance", FRONTEND)
                    .rel("CAN_SSM", "EC2Instance", BACKEND)
                    .rel("CAN_READ", "S3Bucket", "demo-logs")
                    .rel("CAN_READ", "S3Bucket", "demo-secrets"),
            ),
            in_account(
                ResourceFact::new("IAMRole", SSM_ROLE)
                    .prop("roleName", "SSMRole")
                    .prop("isPrivileged", false)
                    .rel("HAS_POLICY", "IAMPolicy", "AmazonSSMManagedInstanceCore"),
            ),
            in_account(
                ResourceFact::new("IAMRole", READ_BUCKET_ROLE)
                    .prop("roleName", "ReadBucketRole")
                    .prop("isPrivileged", false)
                    .rel("HAS_POLICY", "IAMPolicy", "S3ReadOnly")
                    .rel("CAN_READ", "S3Bucket", "demo-logs"),
            ),
            ResourceFact::new("IAMPolicy", "AdministratorAccess").prop("policyName", "AdministratorAccess"),
            ResourceFact::new("IAMPolicy", "AmazonSSMManagedInstanceCore")
                .prop("policyName", "AmazonSSMManagedInstanceCore"),
            ResourceFact::new("IAMPolicy", "S3ReadOnly").prop("policyName", "S3ReadOnly"),
            in_account(
                ResourceFact::new("EC2Instance", FRONTEND)
                    .prop("name", "frontend")
                    .prop("publicIp", "1.2.3.4")
                    .prop("criticality", "high")
                    .prop("ssmEnabled", true)
                    .rel("HAS_ROLE", "IAMRole", ADMIN_ROLE),
            ),
            in_account(
                ResourceFact::new("EC2Instance", BACKEND)
                    .prop("name", "backend")
                    .prop("publicIp", Value::Null)
                    .prop("criticality", "medium")
                    .prop("ssmEnabled", true)
                    .rel("HAS_ROLE", "IAMRole", SSM_ROLE),
            ),
            in_account(
                ResourceFact::new("S3Bucket", "demo-logs")
                    .prop("arn", "arn:aws:s3:::demo-logs")
                    .prop("publicRead", false)
                    .prop("encryption", "AES256"),
            ),
            in_account(
                ResourceFact::new("S3Bucket", "demo-secrets")
                    .prop("arn", "arn:aws:s3:::demo-secrets")
                    .prop("publicRead", false)
                    .prop("encryption", "AES256")
                    .rel("CONTAINS", "Secret", "sec-001"),
            ),
            in_account(
                ResourceFact::new("Secret", "sec-001")
                    .prop("name", "prod/db/password")
                    .prop("classification", "high"),
            ),
        ]
    }
}

#[async_trait]
impl Enumerator for DemoCloud {
    async fn enumerate(&self) -> anyhow::Result<Vec<ResourceFact>> {
        Ok(Self::resources())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoredNode {
    label: String,
    id: String,
    properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredEdge {
    from: String,
    to: String,
    rel_type: String,
    properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct GraphData {
    nodes: BTreeMap<String, StoredNode>,
    edges: BTreeMap<String, StoredEdge>,
}

fn node_key(label: &str, id: &str) -> String {
    format!("{}|{}", label, id)
}

impl GraphData {
    /// Merge on `(label, id)`; returns whether the node is new.
    fn merge_node(&mut self, label: &str, id: &str, properties: &Map<String, Value>) -> bool {
        let key = node_key(label, id);
        let created = !self.nodes.contains_key(&key);
        let node = self.nodes.entry(key).or_insert_with(|| StoredNode {
            label: label.to_string(),
            id: id.to_string(),
            properties: Map::new(),
        });
        for (k, v) in properties {
            node.properties.insert(k.clone(), v.clone());
        }
        created
    }

    /// Merge on `(from, type, to)`; returns whether the edge is new.
    fn merge_edge(
        &mut self,
        from: String,
        rel_type: &str,
        to: String,
        properties: &Map<String, Value>,
    ) -> bool {
        let key = format!("{}|{}|{}", from, rel_type, to);
        let created = !self.edges.contains_key(&key);
        let edge = self.edges.entry(key).or_insert_with(|| StoredEdge {
            from,
            to,
            rel_type: rel_type.to_string(),
            properties: Map::new(),
        });
        for (k, v) in properties {
            edge.properties.insert(k.clone(), v.clone());
        }
        created
    }
}

/// Property graph with upsert-only writes and a bounded path-pattern reader.
///
/// When built with [`InMemoryGraph::persistent`] the graph is written to a
/// JSON file after every ingestion so separate processes see the same data.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    data: Mutex<GraphData>,
    path: Option<PathBuf>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persistent(path: &Path) -> anyhow::Result<Self> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read graph file: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse graph file: {}", path.display()))?
        } else {
            GraphData::default()
        };
        Ok(Self {
            data: Mutex::new(data),
            path: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GraphData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.lock().edges.len()
    }

    async fn persist(&self, snapshot: String) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, snapshot)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn upsert(&self, facts: &[ResourceFact]) -> anyhow::Result<IngestionSummary> {
        let (summary, snapshot) = {
            let mut data = self.lock();
            let mut summary = IngestionSummary::default();
            for fact in facts {
                if data.merge_node(&fact.label, &fact.id, &fact.properties) {
                    summary.nodes_created += 1;
                }
            }
            for fact in facts {
                for rel in &fact.relationships {
                    if data.merge_node(&rel.target_label, &rel.target_id, &Map::new()) {
                        summary.nodes_created += 1;
                    }
                    let created = data.merge_edge(
                        node_key(&fact.label, &fact.id),
                        &rel.rel_type,
                        node_key(&rel.target_label, &rel.target_id),
                        &rel.properties,
                    );
                    if created {
                        summary.edges_created += 1;
                    }
                }
            }
            summary.nodes = data.nodes.len();
            summary.edges = data.edges.len();
            let snapshot = match self.path {
                Some(_) => Some(serde_json::to_string_pretty(&*data)?),
                None => None,
            };
            (summary, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.persist(snapshot).await?;
        }
        debug!(
            nodes = summary.nodes,
            edges = summary.edges,
            created = summary.nodes_created + summary.edges_created,
            "Graph upsert"
        );
        Ok(summary)
    }
}

static MATCH_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*MATCH\s+(?:\w+\s*=\s*)?(.+?)\s+(WHERE\s+.+?\s+)?RETURN\s+.+?\s+LIMIT\s+(\d+)\s*;?\s*$")
        .unwrap()
});

static NODE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\(\s*(?:\w+)?\s*(?::\s*(\w+))?\s*(\{[^}]*\})?\s*\)").unwrap()
});

static REL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-\[\s*(?:\w+)?\s*(?::\s*(\w+))?\s*(\*\s*(\d+)?\s*(\.\.\s*(\d+)?)?)?\s*\]->")
        .unwrap()
});

static PROP_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(\w+)\s*:\s*('[^']*'|"[^"]*"|true|false|-?\d+(?:\.\d+)?)"#).unwrap()
});

#[derive(Debug, Clone, PartialEq)]
struct NodePattern {
    label: Option<String>,
    properties: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
struct RelPattern {
    rel_type: Option<String>,
    min_hops: u32,
    max_hops: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct PathPattern {
    nodes: Vec<NodePattern>,
    rels: Vec<RelPattern>,
    limit: usize,
}

fn parse_properties(raw: Option<&str>) -> Vec<(String, Value)> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    PROP_REGEX
        .captures_iter(raw)
        .map(|caps| {
            let key = caps[1].to_string();
            let literal = &caps[2];
            let value = match literal {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                s if s.starts_with('\'') || s.starts_with('"') => {
                    Value::String(s[1..s.len() - 1].to_string())
                }
                s => serde_json::from_str(s).unwrap_or(Value::Null),
            };
            (key, value)
        })
        .collect()
}

/// Parse `MATCH p=(:A {k:v})-[:R]->(:B)-[*1..3]->(:C) RETURN p LIMIT n`.
fn parse_query(query: &str) -> anyhow::Result<PathPattern> {
    let caps = MATCH_REGEX
        .captures(query)
        .context("expected MATCH <pattern> RETURN ... LIMIT <n>")?;
    if caps.get(2).is_some() {
        bail!("WHERE clauses are not supported by this executor");
    }
    let limit: usize = caps[3].parse().context("invalid LIMIT")?;
    let mut rest = caps[1].trim();

    let mut nodes = Vec::new();
    let mut rels = Vec::new();
    loop {
        let node = NODE_REGEX
            .captures(rest)
            .with_context(|| format!("expected a node pattern at '{}'", rest))?;
        nodes.push(NodePattern {
            label: node.get(1).map(|m| m.as_str().to_string()),
            properties: parse_properties(node.get(2).map(|m| m.as_str())),
        });
        rest = rest[node[0].len()..].trim_start();
        if rest.is_empty() {
            break;
        }

        let rel = REL_REGEX
            .captures(rest)
            .with_context(|| format!("expected an outgoing relationship at '{}'", rest))?;
        let (min_hops, max_hops): (u32, u32) = match rel.get(2) {
            None => (1, 1),
            Some(_) => {
                let lower: Option<u32> = rel.get(3).map(|m| m.as_str().parse()).transpose()?;
                match (rel.get(4), rel.get(5)) {
                    (None, _) => {
                        let exact = lower.context("unbounded variable-length relationship")?;
                        (exact, exact)
                    }
                    (Some(_), Some(upper)) => (lower.unwrap_or(1), upper.as_str().parse()?),
                    (Some(_), None) => bail!("unbounded variable-length relationship"),
                }
            }
        };
        rels.push(RelPattern {
            rel_type: rel.get(1).map(|m| m.as_str().to_string()),
            min_hops: min_hops.max(1),
            max_hops,
        });
        rest = rest[rel[0].len()..].trim_start();
    }
    Ok(PathPattern { nodes, rels, limit })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn node_matches(node: &StoredNode, pattern: &NodePattern) -> bool {
    if let Some(label) = &pattern.label
        && &node.label != label
    {
        return false;
    }
    pattern.properties.iter().all(|(key, expected)| {
        node.properties
            .get(key)
            .is_some_and(|actual| values_equal(actual, expected))
    })
}

struct Search<'a> {
    data: &'a GraphData,
    pattern: &'a PathPattern,
    outgoing: HashMap<&'a str, Vec<&'a StoredEdge>>,
    node_path: Vec<&'a str>,
    edge_path: Vec<&'a StoredEdge>,
    results: Vec<GraphPath>,
}

impl<'a> Search<'a> {
    fn new(data: &'a GraphData, pattern: &'a PathPattern) -> Self {
        let mut outgoing: HashMap<&str, Vec<&StoredEdge>> = HashMap::new();
        for edge in data.edges.values() {
            outgoing.entry(edge.from.as_str()).or_default().push(edge);
        }
        Self {
            data,
            pattern,
            outgoing,
            node_path: Vec::new(),
            edge_path: Vec::new(),
            results: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<GraphPath> {
        let Some(first) = self.pattern.nodes.first() else {
            return Vec::new();
        };
        let starts: Vec<&'a str> = self
            .data
            .nodes
            .iter()
            .filter(|(_, node)| node_matches(node, first))
            .map(|(key, _)| key.as_str())
            .collect();
        for start in starts {
            if self.full() {
                break;
            }
            self.node_path.push(start);
            self.expand(0, 0, start);
            self.node_path.pop();
        }
        self.results
    }

    fn full(&self) -> bool {
        self.results.len() >= self.pattern.limit
    }

    /// Continue segment `seg` (the relationship between pattern nodes `seg`
    /// and `seg + 1`) from `current`, having taken `hops` steps in it.
    fn expand(&mut self, seg: usize, hops: u32, current: &'a str) {
        if self.full() {
            return;
        }
        let Some(rel) = self.pattern.rels.get(seg) else {
            self.emit();
            return;
        };

        if hops >= rel.min_hops
            && let Some(node) = self.data.nodes.get(current)
            && node_matches(node, &self.pattern.nodes[seg + 1])
        {
            self.expand(seg + 1, 0, current);
        }

        if hops < rel.max_hops {
            let edges = self.outgoing.get(current).cloned().unwrap_or_default();
            for edge in edges {
                if rel.rel_type.as_ref().is_some_and(|t| t != &edge.rel_type) {
                    continue;
                }
                let next = edge.to.as_str();
                if self.node_path.contains(&next) {
                    continue;
                }
                self.node_path.push(next);
                self.edge_path.push(edge);
                self.expand(seg, hops + 1, next);
                self.edge_path.pop();
                self.node_path.pop();
            }
        }
    }

    fn emit(&mut self) {
        let mut nodes = Vec::with_capacity(self.node_path.len());
        let mut node_properties = Vec::with_capacity(self.node_path.len());
        for key in &self.node_path {
            if let Some(node) = self.data.nodes.get(*key) {
                nodes.push(PathNode {
                    label: node.label.clone(),
                    id: node.id.clone(),
                });
                node_properties.push(node.properties.clone());
            }
        }
        let edges = self
            .edge_path
            .iter()
            .map(|edge| PathEdge {
                rel_type: edge.rel_type.clone(),
                properties: edge.properties.clone(),
            })
            .collect();
        self.results.push(GraphPath {
            nodes,
            edges,
            node_properties,
        });
    }
}

#[async_trait]
impl QueryExecutor for InMemoryGraph {
    async fn execute(&self, query: &str) -> anyhow::Result<Vec<GraphPath>> {
        let pattern = parse_query(query).context("query rejected by executor")?;
        let data = self.lock();
        let results = Search::new(&data, &pattern).run();
        debug!(rows = results.len(), "Query executed");
        Ok(results)
    }
}

/// A canned question-to-query mapping.
#[derive(Debug, Clone, Copy)]
pub struct QueryTemplate {
    pub name: &'static str,
    pub description: &'static str,
    /// All must appear (case-insensitively) in the question.
    pub keywords: &'static [&'static str],
    pub query: &'static str,
    /// Wider traversal used when deep analysis is requested.
    pub deep_query: Option<&'static str>,
}

/// Most specific first; the first template whose keywords all match wins.
pub const QUERY_PACK: &[QueryTemplate] = &[
    QueryTemplate {
        name: "internet_to_secret",
        description: "Paths from the Internet to stored secrets",
        keywords: &["internet", "secret"],
        query: "MATCH p=(:Internet)-[*1..5]->(:Secret) RETURN p LIMIT 25",
        deep_query: Some("MATCH p=(:Internet)-[*1..8]->(:Secret) RETURN p LIMIT 50"),
    },
    QueryTemplate {
        name: "internet_to_privileged_role",
        description: "Attack paths from the Internet to privileged roles",
        keywords: &["attack path"],
        query: "MATCH p=(:Internet)-[*1..4]->(:IAMRole {isPrivileged:true}) RETURN p LIMIT 25",
        deep_query: Some(
            "MATCH p=(:Internet)-[*1..6]->(:IAMRole {isPrivileged:true}) RETURN p LIMIT 50",
        ),
    },
    QueryTemplate {
        name: "user_can_assume_privileged_role",
        description: "Users that can assume privileged roles",
        keywords: &["assume"],
        query: "MATCH p=(:IAMUser)-[:CAN_ASSUME]->(:IAMRole {isPrivileged:true}) RETURN p LIMIT 100",
        deep_query: None,
    },
    QueryTemplate {
        name: "privileged_role_to_policy",
        description: "Privileged roles and their policies",
        keywords: &["privileged", "role"],
        query: "MATCH p=(r:IAMRole {isPrivileged:true})-[:HAS_POLICY]->(:IAMPolicy) RETURN p LIMIT 100",
        deep_query: None,
    },
    QueryTemplate {
        name: "readable_secrets",
        description: "Roles that can read buckets holding secrets",
        keywords: &["secret"],
        query: "MATCH p=(:IAMRole)-[:CAN_READ]->(:S3Bucket)-[:CONTAINS]->(:Secret) RETURN p LIMIT 100",
        deep_query: None,
    },
    QueryTemplate {
        name: "internet_to_security_group",
        description: "Internet-exposed security groups",
        keywords: &["security group"],
        query: "MATCH p=(:Internet)-[:CAN_REACH]->(:SecurityGroup) RETURN p LIMIT 100",
        deep_query: None,
    },
    QueryTemplate {
        name: "internet_to_instance_via_sg",
        description: "Public path from Internet to EC2 via Security Group",
        keywords: &["internet"],
        query: "MATCH p=(:Internet)-[:CAN_REACH]->(:SecurityGroup)-[:ATTACHED_TO]->(:EC2Instance) RETURN p LIMIT 100",
        deep_query: None,
    },
    QueryTemplate {
        name: "role_to_policy",
        description: "IAM roles and their attached policies",
        keywords: &["role"],
        query: "MATCH p=(r:IAMRole)-[:HAS_POLICY]->(:IAMPolicy) RETURN p LIMIT 100",
        deep_query: None,
    },
];

pub fn select_template(question: &str) -> Option<&'static QueryTemplate> {
    let question = question.to_lowercase();
    QUERY_PACK
        .iter()
        .find(|t| t.keywords.iter().all(|k| question.contains(k)))
}

/// Keyword-driven translator over [`QUERY_PACK`].
pub struct KeywordTranslator;

#[async_trait]
impl QueryTranslator for KeywordTranslator {
    async fn translate(
        &self,
        question: &str,
        deep_analysis: bool,
    ) -> anyhow::Result<Option<String>> {
        Ok(select_template(question).map(|template| {
            debug!(template = template.name, deep_analysis, "Question matched query template");
            let query = if deep_analysis {
                template.deep_query.unwrap_or(template.query)
            } else {
                template.query
            };
            query.to_string()
        }))
    }
}

/// Scores paths by what they end at and where they start.
pub struct SeverityCorrelator;

fn node_prop<'a>(path: &'a GraphPath, index: usize, key: &str) -> Option<&'a Value> {
    path.node_properties.get(index).and_then(|p| p.get(key))
}

impl SeverityCorrelator {
    pub fn score(path: &GraphPath) -> u32 {
        let prop = |i: usize, key: &str| node_prop(path, i, key);
        let last = path.nodes.len().saturating_sub(1);
        let Some(target) = path.nodes.last() else {
            return 0;
        };

        let mut score: u32 = match target.label.as_str() {
            "Secret" => {
                60 + if prop(last, "classification").and_then(Value::as_str) == Some("high") {
                    20
                } else {
                    0
                }
            }
            "IAMRole" if prop(last, "isPrivileged") == Some(&Value::Bool(true)) => 50,
            "IAMPolicy" if target.id == "AdministratorAccess" => 40,
            "EC2Instance" => {
                30 + if prop(last, "criticality").and_then(Value::as_str) == Some("high") {
                    15
                } else {
                    0
                }
            }
            "S3Bucket" => 30,
            "SecurityGroup" => 20,
            _ => 10,
        };
        if path.nodes.first().is_some_and(|n| n.label == "Internet") {
            score += 25;
        }
        let privileged_hops = (0..last)
            .filter(|&i| prop(i, "isPrivileged") == Some(&Value::Bool(true)))
            .count() as u32;
        score += 5 * privileged_hops;
        score.min(100)
    }

    fn title(path: &GraphPath) -> String {
        match (path.nodes.first(), path.nodes.last()) {
            (Some(start), Some(end)) => format!(
                "{} {} reaches {} {} in {} hop(s)",
                start.label,
                start.id,
                end.label,
                end.id,
                path.edges.len()
            ),
            _ => "empty path".to_string(),
        }
    }
}

#[async_trait]
impl Correlator for SeverityCorrelator {
    async fn correlate(&self, results: &[GraphPath]) -> anyhow::Result<Correlation> {
        for (i, path) in results.iter().enumerate() {
            let props_ok =
                path.node_properties.is_empty() || path.node_properties.len() == path.nodes.len();
            if !path.is_well_formed() || !props_ok {
                return Ok(Correlation::Invalid {
                    reason: format!("result row {} is not a consistent path", i),
                });
            }
        }

        let mut seen = BTreeSet::new();
        let mut scored: Vec<(u32, String, &GraphPath)> = results
            .iter()
            .filter(|p| seen.insert(p.display()))
            .map(|p| (Self::score(p), p.display(), p))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let findings: Vec<Finding> = scored
            .into_iter()
            .enumerate()
            .map(|(i, (score, _, path))| Finding {
                id: format!("F-{:03}", i + 1),
                severity: Severity::from_score(score),
                score,
                title: Self::title(path),
                path: path.clone(),
            })
            .collect();
        let ranking = findings.iter().map(|f| f.id.clone()).collect();
        Ok(Correlation::Ranked { findings, ranking })
    }
}

/// One action per risky relationship along each finding's path.
pub struct EdgeRemediationPlanner;

impl EdgeRemediationPlanner {
    fn action_for(rel_type: &str, from: &PathNode, to: &PathNode) -> Option<(String, String)> {
        let action = match rel_type {
            "CAN_REACH" => (
                to.id.clone(),
                format!("Restrict {} ingress on security group {}", from.id, to.id),
            ),
            "HAS_ROLE" => (
                from.id.clone(),
                format!(
                    "Replace instance profile role {} on {} with a least-privilege role",
                    to.id, from.id
                ),
            ),
            "CAN_ASSUME" => (
                to.id.clone(),
                format!("Narrow the trust policy of {} for {}", to.id, from.id),
            ),
            "CAN_READ" => (
                to.id.clone(),
                format!("Scope read access of {} on bucket {}", from.id, to.id),
            ),
            "CONTAINS" => (
                to.id.clone(),
                format!(
                    "Move secret {} out of bucket {} into a managed secret store",
                    to.id, from.id
                ),
            ),
            "HAS_POLICY" => (
                from.id.clone(),
                format!("Review policy {} attached to {}", to.id, from.id),
            ),
            "CAN_SSM" => (
                to.id.clone(),
                format!("Restrict SSM sessions from {} to {}", from.id, to.id),
            ),
            _ => return None,
        };
        Some(action)
    }
}

#[async_trait]
impl RemediationPlanner for EdgeRemediationPlanner {
    async fn plan(&self, findings: &[Finding]) -> anyhow::Result<Vec<RemediationAction>> {
        let mut seen = BTreeSet::new();
        let mut plan = Vec::new();
        for finding in findings {
            let mut planned = false;
            for (i, edge) in finding.path.edges.iter().enumerate() {
                let (Some(from), Some(to)) = (finding.path.nodes.get(i), finding.path.nodes.get(i + 1))
                else {
                    continue;
                };
                let Some((target, action)) = Self::action_for(&edge.rel_type, from, to) else {
                    continue;
                };
                planned = true;
                if seen.insert((target.clone(), action.clone())) {
                    plan.push(RemediationAction {
                        finding_id: finding.id.clone(),
                        target,
                        action,
                    });
                }
            }
            if !planned {
                plan.push(RemediationAction {
                    finding_id: finding.id.clone(),
                    target: finding.path.display(),
                    action: format!("Review path {}", finding.path.display()),
                });
            }
        }
        Ok(plan)
    }
}

/// Writes reports as pretty JSON named by content digest, so re-rendering
/// identical content reuses the same file.
pub struct JsonReportWriter {
    dir: PathBuf,
}

impl JsonReportWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl Reporter for JsonReportWriter {
    async fn render(&self, report: &Value) -> anyhow::Result<String> {
        let content = serde_json::to_string_pretty(report)?;
        let digest = format!("{:x}", Sha256::digest(content.as_bytes()));
        let path = self.dir.join(format!("report-{}.json", &digest[..12]));
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(path.display().to_string())
    }
}
