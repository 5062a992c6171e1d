// src/dag/mod.rs

//! Pipeline graph and scheduling.
//!
//! - [`graph`] compiles node definitions into an immutable DAG with tiers.
//! - [`scheduler`] contains the per-run state machine that decides which
//!   nodes are ready, awaiting a human, skipped or blocked.
//! - [`node_info`] provides node metadata and scheduled node types.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`state_manager`] manages per-run state transitions.

pub mod graph;
pub mod node_info;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;

pub use graph::PipelineGraph;
pub use node_info::{AwaitingNode, NodeInfo, NodeState, ScheduledNode};
pub use scheduler::Scheduler;
pub use scheduler_step::SchedulerStep;
