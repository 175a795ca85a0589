//! Append-only audit trail of stage transitions and routing decisions.
//!
//! Entries are strictly ordered per run by `sequence`. Implementations must
//! reject an entry whose sequence is not exactly one past the last one
//! appended for that run, and must not return from `append` before the entry
//! is durable: the orchestrator commits a checkpoint only after its audit
//! entries have been appended.
//!
//! Writers hold the run's [`AuditLease`] while appending. The lease is
//! exclusive across every handle sharing the log (and, for
//! [`JsonlAuditLog`], across processes) and disappears with its holder, so
//! entries left past the last checkpoint by a dead attempt can be told apart
//! from those of a live one.

use async_trait::async_trait;
use breachgraph_common::{AuditEntry, PayloadSummary, RunId};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::errors::AuditError;

pub mod logger;
pub use logger::JsonlAuditLog;

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;

    /// Highest sequence appended for `run_id`, or 0 when the run has no entries.
    async fn last_sequence(&self, run_id: &RunId) -> Result<u64, AuditError>;

    /// All entries for `run_id` in sequence order.
    async fn read(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, AuditError>;

    /// Claim the exclusive right to append for `run_id`. `None` while another
    /// holder is alive.
    async fn lease(&self, run_id: &RunId) -> Result<Option<AuditLease>, AuditError>;
}

/// Exclusive append claim on one run; released on drop.
pub struct AuditLease {
    _held: Box<dyn Any + Send + Sync>,
}

impl AuditLease {
    pub fn new(held: impl Any + Send + Sync) -> Self {
        Self {
            _held: Box::new(held),
        }
    }
}

impl std::fmt::Debug for AuditLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuditLease")
    }
}

/// Redacted summary of an opaque payload: key names, size and digest only.
pub fn summarize_payload(value: &Value) -> PayloadSummary {
    let keys = match value {
        Value::Object(map) => {
            let mut keys: Vec<String> = map.keys().cloned().collect();
            keys.sort();
            keys
        }
        _ => Vec::new(),
    };
    let encoded = value.to_string();
    let digest = Sha256::digest(encoded.as_bytes());
    PayloadSummary {
        keys,
        bytes: encoded.len(),
        digest: format!("{:x}", digest),
    }
}

/// In-process audit log. Clones share entries and leases.
#[derive(Clone, Default)]
pub struct MemoryAuditLog {
    entries: Arc<Mutex<HashMap<RunId, Vec<AuditEntry>>>>,
    leased: Arc<Mutex<HashSet<RunId>>>,
}

struct MemoryLease {
    leased: Arc<Mutex<HashSet<RunId>>>,
    run_id: RunId,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.leased
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.run_id);
    }
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<RunId, Vec<AuditEntry>>>, AuditError> {
        self.entries
            .lock()
            .map_err(|e| AuditError::Backend(anyhow::anyhow!("audit lock poisoned: {}", e)))
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut entries = self.lock()?;
        let run = entries.entry(entry.run_id.clone()).or_default();
        let last = run.last().map(|e| e.sequence).unwrap_or(0);
        if entry.sequence != last + 1 {
            return Err(AuditError::OutOfOrder {
                run_id: entry.run_id.clone(),
                sequence: entry.sequence,
                last,
            });
        }
        run.push(entry.clone());
        Ok(())
    }

    async fn last_sequence(&self, run_id: &RunId) -> Result<u64, AuditError> {
        Ok(self
            .lock()?
            .get(run_id)
            .and_then(|run| run.last())
            .map(|e| e.sequence)
            .unwrap_or(0))
    }

    async fn read(&self, run_id: &RunId) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self.lock()?.get(run_id).cloned().unwrap_or_default())
    }

    async fn lease(&self, run_id: &RunId) -> Result<Option<AuditLease>, AuditError> {
        let mut leased = self
            .leased
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !leased.insert(run_id.clone()) {
            return Ok(None);
        }
        Ok(Some(AuditLease::new(MemoryLease {
            leased: Arc::clone(&self.leased),
            run_id: run_id.clone(),
        })))
    }
}
