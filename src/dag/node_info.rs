// src/dag/node_info.rs

//! Node metadata and per-run state.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::model::{DataSource, NodeConfig};
use crate::engine::{NodeId, RunId};

/// Lifecycle state of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting on dependencies.
    Pending,
    /// Dependencies resolved and conditions passed; waiting for a worker.
    Ready,
    Running,
    Completed,
    Failed,
    /// Halted until an external resume supplies the node's output.
    AwaitingHuman,
    /// A condition on an incoming edge evaluated false.
    Skipped,
    /// An upstream node failed; this node will never run.
    Blocked,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeState::Completed | NodeState::Failed | NodeState::Skipped | NodeState::Blocked
        )
    }

    /// Whether a dependency in this state counts as resolved downstream.
    pub fn resolves_dependency(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Skipped)
    }

    /// Whether a dependency in this state prevents the dependent from ever running.
    pub fn poisons_dependents(self) -> bool {
        matches!(self, NodeState::Failed | NodeState::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Completed => "completed",
            NodeState::Failed => "failed",
            NodeState::AwaitingHuman => "awaiting_human",
            NodeState::Skipped => "skipped",
            NodeState::Blocked => "blocked",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Static node information from the definition, plus per-run state.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: NodeId,
    pub deps: Vec<NodeId>,
    pub tier: u32,
    pub requires_human: bool,
    pub gate_timeout: Option<Duration>,
    pub refine: bool,
    pub output_fields: Vec<String>,
    pub data_sources: BTreeMap<String, DataSource>,

    pub state: NodeState,
    /// Number of times the node has been dispatched.
    pub attempts: u32,
    /// Why the node is in its current state, for Failed/Skipped/Blocked.
    pub reason: Option<String>,
    /// Result of the incoming edge conditions, once evaluated.
    pub condition_result: Option<bool>,
    pub awaiting_since: Option<DateTime<Utc>>,
}

impl NodeInfo {
    pub fn from_config(
        id: NodeId,
        cfg: &NodeConfig,
        deps: Vec<NodeId>,
        tier: u32,
        gate_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            deps,
            tier,
            requires_human: cfg.requires_human_input,
            gate_timeout,
            refine: cfg.refine,
            output_fields: cfg.output_fields.clone(),
            data_sources: cfg.data_sources.clone(),
            state: NodeState::Pending,
            attempts: 0,
            reason: None,
            condition_result: None,
            awaiting_since: None,
        }
    }
}

/// A node the scheduler wants the executor to run now.
#[derive(Debug, Clone)]
pub struct ScheduledNode {
    pub id: NodeId,
    pub run_id: RunId,
    /// 1-based dispatch attempt.
    pub attempt: u32,
    pub tier: u32,
    pub refine: bool,
    pub output_fields: Vec<String>,
    pub data_sources: BTreeMap<String, DataSource>,
}

impl ScheduledNode {
    pub fn from_node_info(info: &NodeInfo, run_id: RunId) -> Self {
        Self {
            id: info.id.clone(),
            run_id,
            attempt: info.attempts,
            tier: info.tier,
            refine: info.refine,
            output_fields: info.output_fields.clone(),
            data_sources: info.data_sources.clone(),
        }
    }
}

/// A node that has just entered AwaitingHuman.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwaitingNode {
    pub id: NodeId,
    pub timeout: Option<Duration>,
}
