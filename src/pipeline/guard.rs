//! Read-only, depth-bounded check for generated graph queries.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

pub const DEFAULT_MAX_DEPTH: u32 = 8;
pub const DEFAULT_MAX_LIMIT: u64 = 1000;
/// Marker a translator emits when the question cannot be expressed.
pub const UNSUPPORTED_MARKER: &str = "// UNSUPPORTED";

static FENCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:cypher)?\s*\n?(.*?)\n?\s*```").unwrap());

static WRITE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(CREATE|MERGE|SET|DELETE|DETACH|REMOVE|DROP|CALL|FOREACH|LOAD\s+CSV)\b")
        .unwrap()
});

static VAR_LENGTH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*?\*([^\]]*)\]").unwrap());

static BOUNDS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+)?\s*(\.\.\s*(\d+)?)?\s*$").unwrap());

static LIMIT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\b").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("Query is empty")]
    Empty,

    #[error("Question cannot be answered with the current graph schema")]
    Unsupported,

    #[error("Query contains write clause '{0}'")]
    WriteClause(String),

    #[error("Variable-length pattern '[*{0}]' has no upper bound")]
    UnboundedTraversal(String),

    #[error("Traversal depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("Query has no LIMIT clause")]
    MissingLimit,

    #[error("LIMIT {limit} exceeds the maximum of {max}")]
    LimitTooLarge { limit: u64, max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryGuard {
    pub max_depth: u32,
    pub max_limit: u64,
}

impl Default for QueryGuard {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_limit: DEFAULT_MAX_LIMIT,
        }
    }
}

impl QueryGuard {
    /// Return the cleaned query (markdown fences stripped) if it is read-only
    /// and bounded.
    pub fn check(&self, query: &str) -> Result<String, GuardViolation> {
        let mut cleaned = query.trim();
        if let Some(caps) = FENCE_REGEX.captures(cleaned)
            && let Some(inner) = caps.get(1)
        {
            cleaned = inner.as_str().trim();
        }

        if cleaned.is_empty() {
            return Err(GuardViolation::Empty);
        }
        if cleaned.contains(UNSUPPORTED_MARKER) {
            return Err(GuardViolation::Unsupported);
        }
        if let Some(m) = WRITE_REGEX.find(cleaned) {
            let keyword = m.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
            return Err(GuardViolation::WriteClause(keyword.to_uppercase()));
        }

        for caps in VAR_LENGTH_REGEX.captures_iter(cleaned) {
            let spec = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let depth = upper_bound(spec)
                .ok_or_else(|| GuardViolation::UnboundedTraversal(spec.trim().to_string()))?;
            if depth > self.max_depth {
                return Err(GuardViolation::DepthExceeded {
                    depth,
                    max: self.max_depth,
                });
            }
        }

        let limit = LIMIT_REGEX
            .captures(cleaned)
            .and_then(|c| c.get(1))
            .ok_or(GuardViolation::MissingLimit)?;
        let limit: u64 = limit.as_str().parse().unwrap_or(u64::MAX);
        if limit > self.max_limit {
            return Err(GuardViolation::LimitTooLarge {
                limit,
                max: self.max_limit,
            });
        }

        Ok(cleaned.to_string())
    }
}

/// Upper hop bound of a `*min..max` spec; `None` when unbounded or malformed.
fn upper_bound(spec: &str) -> Option<u32> {
    let caps = BOUNDS_REGEX.captures(spec)?;
    let exact = caps.get(1).and_then(|m| m.as_str().parse::<u32>().ok());
    match caps.get(2) {
        // `*..5`, `*1..5`
        Some(_) => caps.get(3).and_then(|m| m.as_str().parse().ok()),
        // `*3`; a bare `*` has no bound
        None => exact,
    }
}
