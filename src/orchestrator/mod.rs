//! Run driver, routing and in-flight bookkeeping.

pub mod router;
pub mod runner;
pub mod state;

pub use router::{Router, RoutingTable};
pub use runner::Orchestrator;
pub use state::{InFlightRuns, RunGuard, RunOutcome};
