// src/exec/backend.rs

//! Pluggable executor backend abstraction.
//!
//! The runtime talks to an `ExecutorBackend` instead of spawning workers
//! itself. This makes it easy to swap in a fake executor in tests while
//! keeping the production executor implementation here.
//!
//! - `RealExecutorBackend` is the default implementation. It runs each
//!   scheduled node on its own Tokio task through a [`NodeRunner`] and sends
//!   the resulting event back to the runtime.
//! - Tests can provide their own `ExecutorBackend` that, for example, records
//!   which nodes were scheduled and directly emits `NodeCompleted` events.
//!
//! The worker bound is enforced by the scheduler, which never has more than
//! `workers` nodes Running at once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dag::ScheduledNode;
use crate::engine::{NodeId, RuntimeEvent};
use crate::errors::Result;

use super::node_runner::NodeRunner;
use super::retry::CancelFlag;

/// Trait abstracting how scheduled nodes are executed.
///
/// Production code uses [`RealExecutorBackend`]; tests can provide their own
/// implementation that doesn't call any collaborator.
pub trait ExecutorBackend: Send {
    /// Dispatch the given nodes for execution.
    ///
    /// Every dispatched node must eventually produce exactly one
    /// `NodeCompleted` or `NodeFailed` event on the runtime channel.
    fn dispatch(
        &mut self,
        nodes: Vec<ScheduledNode>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Raise the cancellation flag of every running node.
    fn cancel_all(&mut self);
}

/// Internal handle for a currently-running node.
struct ActiveNode {
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// Real executor backend used in production.
pub struct RealExecutorBackend {
    runner: Arc<NodeRunner>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    active: HashMap<NodeId, ActiveNode>,
}

impl std::fmt::Debug for RealExecutorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealExecutorBackend")
            .field("active", &self.active.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RealExecutorBackend {
    pub fn new(runner: NodeRunner, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            runner: Arc::new(runner),
            runtime_tx,
            active: HashMap::new(),
        }
    }

    fn spawn_node(&mut self, node: ScheduledNode) {
        let id = node.id.clone();
        let cancel = CancelFlag::new();
        let runner = Arc::clone(&self.runner);
        let tx = self.runtime_tx.clone();
        let flag = cancel.clone();

        let handle = tokio::spawn(async move {
            let node_id = node.id.clone();
            let event = runner.execute(node, flag).await;
            if tx.send(event).await.is_err() {
                warn!(node = %node_id, "runtime channel closed before node result was delivered");
            }
            debug!(node = %node_id, "node worker finished");
        });

        self.active.insert(id, ActiveNode { cancel, handle });
    }
}

impl ExecutorBackend for RealExecutorBackend {
    fn dispatch(
        &mut self,
        nodes: Vec<ScheduledNode>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.active.retain(|_, a| !a.handle.is_finished());
        for node in nodes {
            if let Some(existing) = self.active.get(&node.id) {
                // A retry may be dispatched while the failed attempt's task
                // is still delivering its event.
                debug!(
                    node = %node.id,
                    attempt = node.attempt,
                    finished = existing.handle.is_finished(),
                    "replacing worker handle for node"
                );
            }
            self.spawn_node(node);
        }
        Box::pin(async { Ok(()) })
    }

    fn cancel_all(&mut self) {
        let running: Vec<&NodeId> = self
            .active
            .iter()
            .filter(|(_, a)| !a.handle.is_finished())
            .map(|(id, _)| id)
            .collect();
        info!(?running, "cancelling running nodes");
        for active in self.active.values() {
            active.cancel.cancel();
        }
    }
}
