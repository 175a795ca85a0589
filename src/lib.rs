//! breachgraph: a checkpointed, resumable stage orchestrator driving an
//! attack-surface analysis pipeline over a cloud resource graph.

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gates;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod stage;
pub mod ui;
pub mod workflow_config;
