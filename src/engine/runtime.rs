// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::dag::ScheduledNode;
use crate::errors::Result;
use crate::exec::ExecutorBackend;
use crate::report::RunReport;
use crate::store::CheckpointStore;

use super::core::CoreRuntime;
use super::{CoreCommand, NodeId, RuntimeEvent};

/// Async shell around [`CoreRuntime`]. The core decides; this type performs
/// the side effects it asks for: handing nodes to the `ExecutorBackend`,
/// arming human-gate timers, writing checkpoints and publishing reports.
pub struct Runtime<E: ExecutorBackend> {
    core: CoreRuntime,
    event_rx: mpsc::Receiver<RuntimeEvent>,
    /// Loopback sender used by gate timers.
    event_tx: mpsc::Sender<RuntimeEvent>,
    executor: E,
    checkpoints: Option<CheckpointStore>,
    reports: Option<watch::Sender<RunReport>>,
    timers: HashMap<NodeId, JoinHandle<()>>,
    checkpoint_error: Option<String>,
}

impl<E: ExecutorBackend> fmt::Debug for Runtime<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("core", &self.core)
            .field("timers", &self.timers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<E: ExecutorBackend> Runtime<E> {
    pub fn new(
        core: CoreRuntime,
        event_rx: mpsc::Receiver<RuntimeEvent>,
        event_tx: mpsc::Sender<RuntimeEvent>,
        executor: E,
    ) -> Self {
        Self {
            core,
            event_rx,
            event_tx,
            executor,
            checkpoints: None,
            reports: None,
            timers: HashMap::new(),
            checkpoint_error: None,
        }
    }

    /// Persist a checkpoint whenever the core asks for one.
    pub fn with_checkpoints(mut self, checkpoints: CheckpointStore) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Publish a fresh report after every step.
    pub fn with_reports(mut self, reports: watch::Sender<RunReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Start the run and pump events through the core until it says stop or
    /// every sender is gone.
    ///
    /// The returned report reflects the moment the loop stopped, which may
    /// be a suspension on a human gate rather than a finished run.
    pub async fn run(mut self) -> Result<RunReport> {
        info!(run_id = %self.core.run_id(), "docdag runtime started");

        let step = self.core.start();
        let mut keep_running = self.apply(step.commands, step.keep_running).await?;

        while keep_running {
            let Some(event) = self.event_rx.recv().await else {
                info!("all event senders dropped; leaving the loop");
                break;
            };
            debug!(?event, "event received");

            let step = self.core.step(event);
            keep_running = self.apply(step.commands, step.keep_running).await?;
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        if !self.core.scheduler().is_finished() {
            self.executor.cancel_all();
        }

        let report = self.report();
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            "runtime exiting"
        );
        Ok(report)
    }

    async fn apply(&mut self, commands: Vec<CoreCommand>, keep_running: bool) -> Result<bool> {
        for command in commands {
            self.execute_command(command).await?;
        }
        self.publish();

        if !keep_running {
            info!("core requested exit; stopping runtime");
        }
        Ok(keep_running)
    }

    async fn execute_command(&mut self, command: CoreCommand) -> Result<()> {
        match command {
            CoreCommand::Dispatch(nodes) => {
                self.dispatch(nodes).await?;
            }
            CoreCommand::ArmGateTimer { node, after } => {
                self.arm_gate_timer(node, after);
            }
            CoreCommand::CancelRunning => {
                self.executor.cancel_all();
            }
            CoreCommand::Checkpoint => self.save_checkpoint(),
            CoreCommand::Finished => {
                info!(run_id = %self.core.run_id(), "core reported run finished");
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, nodes: Vec<ScheduledNode>) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        for node in &nodes {
            debug!(node = %node.id, attempt = node.attempt, tier = node.tier, "dispatching");
        }

        self.executor.dispatch(nodes).await
    }

    fn arm_gate_timer(&mut self, node: NodeId, after: Duration) {
        debug!(node = %node, ?after, "arming human gate timer");
        let tx = self.event_tx.clone();
        let timer_node = node.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(RuntimeEvent::GateTimedOut { node: timer_node }).await;
        });
        if let Some(previous) = self.timers.insert(node, handle) {
            previous.abort();
        }
    }

    fn publish(&self) {
        if let Some(reports) = &self.reports {
            reports.send_replace(self.report());
        }
    }

    fn report(&self) -> RunReport {
        let mut report = self.core.report();
        report.checkpoint_error = self.checkpoint_error.clone();
        report
    }

    /// A failed write never ends the run; the previous checkpoint stays on
    /// disk and the failure is surfaced in the report.
    fn save_checkpoint(&mut self) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        match checkpoints.save(&self.core.checkpoint()) {
            Ok(()) => self.checkpoint_error = None,
            Err(e) => {
                error!(run_id = %self.core.run_id(), error = %e, "checkpoint write failed");
                self.checkpoint_error = Some(e.to_string());
            }
        }
    }
}
