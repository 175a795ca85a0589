//! Shared domain types for the breachgraph orchestrator.
//!
//! Everything in this crate is plain data: run state, stage records, routing
//! decisions and audit entries. Persistence, routing logic and stage execution
//! live in the `breachgraph` crate.

pub mod audit;
pub mod keys;
pub mod routing;
pub mod run;

pub use audit::{AuditEntry, AuditEventType, PayloadSummary};
pub use routing::{NextStep, TerminalStatus};
pub use run::{
    Context, ParseStatusError, PendingApproval, RunId, RunState, RunStatus, RunSummary,
    StageRecord,
};
