// src/dag/scheduler.rs

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::model::PipelineFile;
use crate::dag::graph::PipelineGraph;
use crate::dag::node_info::{NodeInfo, NodeState};
use crate::dag::scheduler_step::SchedulerStep;
use crate::dag::state_manager::{ReadOnlyStateManager, StateManager};
use crate::engine::{NodeId, RunId};
use crate::errors::{DocdagError, NodeError, Result};
use crate::store::{NodeCheckpoint, StoreSnapshot};

/// Scheduler holds the immutable pipeline graph plus mutable per-run state.
///
/// It is responsible for:
/// - evaluating edge conditions once a node's dependencies resolve
/// - moving nodes to Ready, AwaitingHuman or Skipped
/// - dispatching Ready nodes up to the worker limit, lowest tier first
/// - retrying or failing nodes, and blocking dependents of failures
///
/// It does no IO. Every state change goes through one of the `step_*`
/// methods, which report what changed as a [`SchedulerStep`].
#[derive(Debug)]
pub struct Scheduler {
    graph: PipelineGraph,
    nodes: BTreeMap<NodeId, NodeInfo>,
    run_id: RunId,
    workers: usize,
    node_retries: u32,
    /// Set once the run is halted or cancelled; nothing new is dispatched.
    stopped: Option<String>,
}

impl Scheduler {
    /// Construct a scheduler from a validated [`PipelineFile`].
    pub fn from_pipeline(cfg: &PipelineFile, run_id: RunId) -> Result<Self> {
        let graph = PipelineGraph::build(&cfg.node)?;

        let mut nodes = BTreeMap::new();
        for (id, nc) in cfg.node.iter() {
            let deps = graph.dependencies_of(id).to_vec();
            let tier = graph.tier_of(id).unwrap_or(0);
            let timeout = nc.gate_timeout().map_err(DocdagError::Config)?;
            nodes.insert(
                id.clone(),
                NodeInfo::from_config(id.clone(), nc, deps, tier, timeout),
            );
        }

        Ok(Self {
            graph,
            nodes,
            run_id,
            workers: cfg.config.workers.max(1),
            node_retries: cfg.config.node_retries,
            stopped: None,
        })
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn node(&self, id: &str) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn node_state(&self, id: &str) -> Option<NodeState> {
        self.nodes.get(id).map(|n| n.state)
    }

    pub fn nodes_in(&self, state: NodeState) -> Vec<NodeId> {
        ReadOnlyStateManager::new(&self.nodes).in_state(state)
    }

    /// Every node is Completed, Failed, Skipped or Blocked.
    pub fn is_finished(&self) -> bool {
        ReadOnlyStateManager::new(&self.nodes).all_terminal()
    }

    /// Nothing can make progress without an external resume.
    pub fn is_quiescent(&self) -> bool {
        let ro = ReadOnlyStateManager::new(&self.nodes);
        ro.count(NodeState::Running) == 0 && ro.count(NodeState::Ready) == 0
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stopped.as_deref()
    }

    /// Promote every node whose dependencies are already resolved and fill
    /// the worker pool. Called once at run start (and after a restore).
    pub fn step_start(&mut self, snapshot: &StoreSnapshot) -> SchedulerStep {
        debug!(run_id = %self.run_id, nodes = self.nodes.len(), "scheduler: starting run");
        self.advance(snapshot)
    }

    /// A Running node finished successfully.
    pub fn step_completion(&mut self, node: &str, snapshot: &StoreSnapshot) -> SchedulerStep {
        match self.nodes.get_mut(node) {
            Some(info) if info.state == NodeState::Running => {
                info.state = NodeState::Completed;
                info.reason = None;
                debug!(node = %node, attempt = info.attempts, "node completed");
            }
            Some(info) => {
                warn!(node = %node, state = %info.state, "completion for node that is not running; ignoring");
                return self.finish_step(SchedulerStep::default());
            }
            None => {
                warn!(node = %node, "completion for unknown node; ignoring");
                return self.finish_step(SchedulerStep::default());
            }
        }
        self.advance(snapshot)
    }

    /// A Running node failed.
    ///
    /// Retryable failures send the node back to Ready while it has node
    /// retries left. Otherwise it becomes Failed and every Pending
    /// descendant becomes Blocked.
    pub fn step_failure(
        &mut self,
        node: &str,
        error: &NodeError,
        snapshot: &StoreSnapshot,
    ) -> SchedulerStep {
        let node_retries = self.node_retries;
        let stopped = self.stopped.is_some();
        let mut step = SchedulerStep::default();

        let Some(info) = self.nodes.get_mut(node) else {
            warn!(node = %node, "failure for unknown node; ignoring");
            return self.finish_step(step);
        };
        if info.state != NodeState::Running {
            warn!(node = %node, state = %info.state, "failure for node that is not running; ignoring");
            return self.finish_step(step);
        }

        if error.is_retryable() && info.attempts <= node_retries && !stopped {
            info!(
                node = %node,
                attempt = info.attempts,
                node_retries,
                error = %error,
                "node failed; scheduling another attempt"
            );
            info.state = NodeState::Ready;
            info.reason = Some(error.to_string());
            step.retried.push(node.to_string());
        } else {
            warn!(node = %node, attempt = info.attempts, error = %error, "node failed");
            info.state = NodeState::Failed;
            info.reason = Some(error.to_string());
            step.newly_failed.push(node.to_string());

            let mut manager = StateManager::new(&self.graph, &mut self.nodes, &self.run_id);
            step.newly_blocked = manager.block_dependents(node);
        }

        let next = self.advance(snapshot);
        step.merge(next);
        step
    }

    /// Check that `node` can accept a human payload.
    pub fn check_resumable(&self, node: &str) -> Result<()> {
        match self.nodes.get(node) {
            None => Err(DocdagError::UnknownNode(node.to_string())),
            Some(info) if info.state != NodeState::AwaitingHuman => {
                Err(DocdagError::NotAwaitingHuman {
                    node: node.to_string(),
                    state: info.state.to_string(),
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// The human payload for an AwaitingHuman node has been written to the
    /// store; complete the node and release its dependents.
    pub fn step_resume(&mut self, node: &str, snapshot: &StoreSnapshot) -> Result<SchedulerStep> {
        self.complete_gate(node)?;
        Ok(self.advance(snapshot))
    }

    /// Mark an AwaitingHuman node Completed without promoting anything.
    /// Used when a restored run is resumed before it starts; the next
    /// `step_start` releases the dependents.
    pub fn complete_gate(&mut self, node: &str) -> Result<()> {
        self.check_resumable(node)?;
        if let Some(info) = self.nodes.get_mut(node) {
            info!(node = %node, "human input received; completing node");
            info.state = NodeState::Completed;
            info.attempts += 1;
            info.reason = None;
            info.awaiting_since = None;
        }
        Ok(())
    }

    /// The configured gate timeout expired before a resume arrived.
    pub fn step_gate_timeout(&mut self, node: &str, snapshot: &StoreSnapshot) -> SchedulerStep {
        if self.node_state(node) != Some(NodeState::AwaitingHuman) {
            debug!(node = %node, "gate timer fired for node no longer awaiting; ignoring");
            return self.finish_step(SchedulerStep::default());
        }

        let error = NodeError::HumanGateTimeout {
            node: node.to_string(),
        };
        warn!(node = %node, "human gate timed out; failing branch");

        let mut step = SchedulerStep::default();
        let mut manager = StateManager::new(&self.graph, &mut self.nodes, &self.run_id);
        manager.set_state(node, NodeState::Failed, Some(error.to_string()));
        step.newly_failed.push(node.to_string());
        step.newly_blocked = manager.block_dependents(node);

        let next = self.advance(snapshot);
        step.merge(next);
        step
    }

    /// Halt or cancel the run: nothing new is dispatched and every node that
    /// has not started becomes Blocked. Running nodes finish on their own.
    pub fn step_stop(&mut self, reason: &str) -> SchedulerStep {
        if self.stopped.is_some() {
            return self.finish_step(SchedulerStep::default());
        }
        info!(run_id = %self.run_id, reason = %reason, "scheduler: stopping run");
        self.stopped = Some(reason.to_string());

        let mut manager = StateManager::new(&self.graph, &mut self.nodes, &self.run_id);
        let step = SchedulerStep {
            newly_blocked: manager.stop_unstarted(reason),
            ..Default::default()
        };
        self.finish_step(step)
    }

    /// Per-node state for a durable checkpoint.
    pub fn checkpoint_nodes(&self) -> BTreeMap<NodeId, NodeCheckpoint> {
        self.nodes
            .iter()
            .map(|(id, info)| {
                (
                    id.clone(),
                    NodeCheckpoint {
                        state: info.state,
                        attempts: info.attempts,
                        reason: info.reason.clone(),
                        condition_result: info.condition_result,
                        awaiting_since: info.awaiting_since,
                    },
                )
            })
            .collect()
    }

    /// Reapply checkpointed node state.
    ///
    /// Nodes that were Ready or Running when the checkpoint was taken go back
    /// to Pending: their work never reached the store and will be redone.
    pub fn restore(&mut self, checkpoint: &BTreeMap<NodeId, NodeCheckpoint>) {
        for (id, saved) in checkpoint {
            let Some(info) = self.nodes.get_mut(id) else {
                warn!(node = %id, "checkpoint names a node not in the pipeline; ignoring");
                continue;
            };
            info.attempts = saved.attempts;
            info.reason = saved.reason.clone();
            info.awaiting_since = saved.awaiting_since;
            match saved.state {
                NodeState::Ready | NodeState::Running => {
                    info.state = NodeState::Pending;
                    info.condition_result = None;
                }
                state => {
                    info.state = state;
                    info.condition_result = saved.condition_result;
                }
            }
        }
        debug!(run_id = %self.run_id, "scheduler: restored node state from checkpoint");
    }

    /// Promote resolved Pending nodes and fill free worker slots.
    fn advance(&mut self, snapshot: &StoreSnapshot) -> SchedulerStep {
        let mut step = SchedulerStep::default();
        if self.stopped.is_some() {
            return self.finish_step(step);
        }

        let mut manager = StateManager::new(&self.graph, &mut self.nodes, &self.run_id);
        let promotion = manager.promote_pending(snapshot);
        step.newly_awaiting = promotion.awaiting;
        step.newly_skipped = promotion.skipped;
        step.newly_blocked = promotion.blocked;

        let capacity = self.workers.saturating_sub(manager.running_count());
        step.newly_scheduled = manager.dispatch_ready(capacity);

        self.finish_step(step)
    }

    fn finish_step(&self, mut step: SchedulerStep) -> SchedulerStep {
        step.run_finished = self.is_finished();
        if step.run_finished {
            info!(run_id = %self.run_id, "scheduler: all nodes terminal");
        }
        step
    }
}
