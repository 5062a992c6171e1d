// src/dag/state_manager.rs

//! Per-run state transitions for nodes in the scheduler.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::dag::PipelineGraph;
use crate::dag::node_info::{AwaitingNode, NodeInfo, NodeState, ScheduledNode};
use crate::engine::{NodeId, RunId};
use crate::store::StoreSnapshot;

/// Outcome of one promotion pass over Pending nodes.
#[derive(Debug, Default)]
pub struct Promotion {
    pub ready: Vec<NodeId>,
    pub awaiting: Vec<AwaitingNode>,
    pub skipped: Vec<NodeId>,
    pub blocked: Vec<NodeId>,
}

/// Mutating view over the node map used by [`Scheduler`](crate::dag::Scheduler).
pub struct StateManager<'a> {
    graph: &'a PipelineGraph,
    nodes: &'a mut BTreeMap<NodeId, NodeInfo>,
    run_id: &'a RunId,
}

impl<'a> StateManager<'a> {
    pub fn new(
        graph: &'a PipelineGraph,
        nodes: &'a mut BTreeMap<NodeId, NodeInfo>,
        run_id: &'a RunId,
    ) -> Self {
        Self {
            graph,
            nodes,
            run_id,
        }
    }

    /// Move Pending nodes whose dependencies are all resolved forward.
    ///
    /// Walks nodes in topological order so that a skip or block cascades to
    /// every descendant within a single pass. Edge conditions are evaluated
    /// exactly once, here, against `snapshot`.
    pub fn promote_pending(&mut self, snapshot: &StoreSnapshot) -> Promotion {
        let mut out = Promotion::default();
        let graph = self.graph;

        for id in graph.topological_order() {
            let Some(info) = self.nodes.get(id) else {
                warn!(node = %id, "node in graph not present in node map");
                continue;
            };
            if info.state != NodeState::Pending {
                continue;
            }

            let ro = ReadOnlyStateManager::new(self.nodes);
            match ro.dependency_status(info) {
                DependencyStatus::Waiting => continue,
                DependencyStatus::Poisoned(upstream) => {
                    let reason = format!("dependency '{upstream}' did not complete");
                    self.set_state(id, NodeState::Blocked, Some(reason));
                    out.blocked.push(id.clone());
                    continue;
                }
                DependencyStatus::Resolved => {}
            }

            let failed_condition = graph
                .conditions_of(id)
                .iter()
                .find(|(_, predicate)| !predicate.evaluate(snapshot))
                .map(|(on, _)| on.clone());

            let Some(info) = self.nodes.get_mut(id) else {
                continue;
            };
            info.condition_result = Some(failed_condition.is_none());

            if let Some(on) = failed_condition {
                info!(node = %id, upstream = %on, "edge condition false; skipping node");
                info.state = NodeState::Skipped;
                info.reason = Some(format!("condition on edge from '{on}' evaluated false"));
                out.skipped.push(id.clone());
            } else if info.requires_human {
                info!(node = %id, "node requires human input; awaiting resume");
                info.state = NodeState::AwaitingHuman;
                info.awaiting_since = Some(Utc::now());
                out.awaiting.push(AwaitingNode {
                    id: id.clone(),
                    timeout: info.gate_timeout,
                });
            } else {
                debug!(node = %id, tier = info.tier, "dependencies resolved; marking Ready");
                info.state = NodeState::Ready;
                out.ready.push(id.clone());
            }
        }

        out
    }

    /// Mark every Pending transitive dependent of `failed` as Blocked.
    ///
    /// Returns the newly blocked nodes in topological order.
    pub fn block_dependents(&mut self, failed: &str) -> Vec<NodeId> {
        let graph = self.graph;
        let descendants = graph.descendants_of(failed);
        let mut newly_blocked = Vec::new();

        for id in graph.topological_order() {
            if !descendants.contains(id) {
                continue;
            }
            if let Some(info) = self.nodes.get_mut(id) {
                if info.state == NodeState::Pending {
                    debug!(node = %id, upstream = %failed, "blocking dependent of failed node");
                    info.state = NodeState::Blocked;
                    info.reason = Some(format!("dependency '{failed}' did not complete"));
                    newly_blocked.push(id.clone());
                }
            }
        }

        newly_blocked
    }

    /// Dispatch Ready nodes up to `capacity` free workers, lowest tier first.
    pub fn dispatch_ready(&mut self, capacity: usize) -> Vec<ScheduledNode> {
        let mut ready: Vec<(u32, NodeId)> = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Ready)
            .map(|n| (n.tier, n.id.clone()))
            .collect();
        ready.sort();

        let mut scheduled = Vec::new();
        for (_, id) in ready.into_iter().take(capacity) {
            if let Some(info) = self.nodes.get_mut(&id) {
                info.state = NodeState::Running;
                info.attempts += 1;
                info!(
                    node = %info.id,
                    run_id = %self.run_id,
                    attempt = info.attempts,
                    tier = info.tier,
                    "dispatching node"
                );
                scheduled.push(ScheduledNode::from_node_info(info, self.run_id.clone()));
            }
        }
        scheduled
    }

    /// Move every node that has not started into Blocked with `reason`.
    pub fn stop_unstarted(&mut self, reason: &str) -> Vec<NodeId> {
        let mut stopped = Vec::new();
        for info in self.nodes.values_mut() {
            if matches!(
                info.state,
                NodeState::Pending | NodeState::Ready | NodeState::AwaitingHuman
            ) {
                info.state = NodeState::Blocked;
                info.reason = Some(reason.to_string());
                stopped.push(info.id.clone());
            }
        }
        stopped
    }

    pub fn set_state(&mut self, id: &str, state: NodeState, reason: Option<String>) {
        if let Some(info) = self.nodes.get_mut(id) {
            info.state = state;
            info.reason = reason;
        }
    }

    pub fn running_count(&self) -> usize {
        ReadOnlyStateManager::new(self.nodes).count(NodeState::Running)
    }

    pub fn all_terminal(&self) -> bool {
        ReadOnlyStateManager::new(self.nodes).all_terminal()
    }
}

/// Where a node stands with respect to its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    /// Every dependency is Completed or Skipped.
    Resolved,
    /// At least one dependency is still in progress.
    Waiting,
    /// A dependency is Failed or Blocked; carries its id.
    Poisoned(NodeId),
}

/// Read-only view for dependency checks and counting.
pub struct ReadOnlyStateManager<'a> {
    nodes: &'a BTreeMap<NodeId, NodeInfo>,
}

impl<'a> ReadOnlyStateManager<'a> {
    pub fn new(nodes: &'a BTreeMap<NodeId, NodeInfo>) -> Self {
        Self { nodes }
    }

    pub fn dependency_status(&self, info: &NodeInfo) -> DependencyStatus {
        let mut waiting = false;
        for dep_id in &info.deps {
            let Some(dep) = self.nodes.get(dep_id) else {
                warn!(node = %info.id, dep = %dep_id, "dependency missing from node map");
                return DependencyStatus::Waiting;
            };
            if dep.state.poisons_dependents() {
                return DependencyStatus::Poisoned(dep_id.clone());
            }
            if !dep.state.resolves_dependency() {
                waiting = true;
            }
        }
        if waiting {
            DependencyStatus::Waiting
        } else {
            DependencyStatus::Resolved
        }
    }

    pub fn count(&self, state: NodeState) -> usize {
        self.nodes.values().filter(|n| n.state == state).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.state.is_terminal())
    }

    pub fn in_state(&self, state: NodeState) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.state == state)
            .map(|n| n.id.clone())
            .collect()
    }
}
