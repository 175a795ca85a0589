//! Well-known context keys and outcome tags.
//!
//! Keys are the contract between stages: a stage writes a key, later stages
//! read it. The orchestrator treats the values as opaque except for the
//! reserved keys at the bottom of this file.

pub const RESOURCES: &str = "resources";
pub const INGESTION_SUMMARY: &str = "ingestion_summary";
pub const QUESTION: &str = "question";
pub const DEEP_ANALYSIS: &str = "deep_analysis";
pub const GENERATED_QUERY: &str = "generated_query";
pub const TRANSLATION_ERROR: &str = "translation_error";
pub const QUERY_RESULTS: &str = "query_results";
pub const QUERY_ERROR: &str = "query_error";
pub const VALIDATION_ERROR: &str = "validation_error";
pub const FINDINGS: &str = "findings";
pub const RANKING: &str = "ranking";
pub const REMEDIATION_PLAN: &str = "remediation_plan";
pub const REPORT_ARTIFACT: &str = "report_artifact";

/// Decision recorded by `resume`.
pub const HUMAN_DECISION: &str = "human_decision";
/// Stage the decision was collected for.
pub const HUMAN_DECISION_POINT: &str = "human_decision_point";
/// Per-stage revisit counters, owned by the orchestrator.
pub const RETRY_COUNTS: &str = "retry_counts";

/// Keys only the orchestrator writes. Stage deltas and initial input may not.
pub const RESERVED: [&str; 3] = [HUMAN_DECISION, HUMAN_DECISION_POINT, RETRY_COUNTS];

pub fn is_reserved(key: &str) -> bool {
    RESERVED.iter().any(|reserved| *reserved == key)
}

pub mod outcome {
    pub const OK: &str = "ok";
    pub const RETRY: &str = "retry";
    /// Produced by the orchestrator when a stage exceeds its declared duration.
    pub const TIMEOUT: &str = "timeout";
    /// Recorded in history for a stage whose handler failed unrecoverably.
    pub const ERROR: &str = "error";
    pub const TRANSLATION_ERROR: &str = "translation_error";
    pub const QUERY_ERROR: &str = "query_error";
    pub const FINDINGS: &str = "findings";
    pub const NO_FINDINGS: &str = "no_findings";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const APPROVE: &str = "approve";
    pub const REJECT: &str = "reject";
}
