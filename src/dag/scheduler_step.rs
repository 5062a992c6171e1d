// src/dag/scheduler_step.rs

//! Step-by-step result types for the scheduler.

use crate::dag::node_info::{AwaitingNode, ScheduledNode};
use crate::engine::NodeId;

/// Structured result of a single scheduler "step".
///
/// Tests use this to step the pipeline manually and assert on what changed.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStep {
    /// Nodes dispatched to workers by this step.
    pub newly_scheduled: Vec<ScheduledNode>,
    /// Nodes that entered AwaitingHuman.
    pub newly_awaiting: Vec<AwaitingNode>,
    /// Nodes whose edge condition evaluated false.
    pub newly_skipped: Vec<NodeId>,
    /// Nodes that failed terminally (retries exhausted or not retryable).
    pub newly_failed: Vec<NodeId>,
    /// Transitive dependents of failed nodes.
    pub newly_blocked: Vec<NodeId>,
    /// Failed nodes sent back to Ready for another attempt.
    pub retried: Vec<NodeId>,
    /// Every node is now in a terminal state.
    pub run_finished: bool,
}

impl SchedulerStep {
    pub fn merge(&mut self, other: SchedulerStep) {
        self.newly_scheduled.extend(other.newly_scheduled);
        self.newly_awaiting.extend(other.newly_awaiting);
        self.newly_skipped.extend(other.newly_skipped);
        self.newly_failed.extend(other.newly_failed);
        self.newly_blocked.extend(other.newly_blocked);
        self.retried.extend(other.retried);
        self.run_finished = other.run_finished;
    }
}
