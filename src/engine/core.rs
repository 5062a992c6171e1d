// src/engine/core.rs

//! Pure core runtime state machine.
//!
//! This module contains a synchronous, deterministic "core runtime" that
//! consumes [`RuntimeEvent`]s and produces:
//! - an updated core state (scheduler, findings, refinement history)
//! - a list of "commands" describing what the IO shell should do next
//!
//! The async/IO-heavy shell (`engine::runtime::Runtime`) is responsible for:
//! - reading events from channels
//! - sending `ScheduledNode`s to the executor
//! - arming gate timers, saving checkpoints, publishing reports
//!
//! The core touches the artifact store (an in-process, synchronous
//! interface) but no channels, files or processes, so it can be unit tested
//! without Tokio.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::PipelineFile;
use crate::crossref::{FindingSet, Validator};
use crate::dag::{NodeState, Scheduler};
use crate::engine::event_handlers::CoreStep;
use crate::engine::{NodeId, RunId, RuntimeEvent, RuntimeOptions};
use crate::errors::Result;
use crate::generation::RefinementRecord;
use crate::report::{NodeReport, RunReport, RunStatus};
use crate::store::{ArtifactStore, FieldName, MemoryArtifactStore, RunCheckpoint};

/// Stop reason recorded when `halt_on_error` trips.
pub const HALT_REASON: &str = "run halted after an error finding";
/// Stop reason recorded on cancellation.
pub const CANCEL_REASON: &str = "cancelled";

/// Pure core runtime state.
///
/// This owns:
/// - the pipeline scheduler
/// - a handle to the artifact store and the rule validator
/// - the current findings and refinement history
/// - runtime options (e.g. `halt_on_error`)
#[derive(Debug)]
pub struct CoreRuntime {
    pub(super) scheduler: Scheduler,
    pub(super) store: Arc<dyn ArtifactStore>,
    pub(super) validator: Validator,
    pub(super) findings: FindingSet,
    pub(super) refinement: BTreeMap<NodeId, RefinementRecord>,
    pub(super) options: RuntimeOptions,
    pub(super) halted: bool,
    pub(super) cancelled: bool,
}

impl CoreRuntime {
    pub fn new(
        scheduler: Scheduler,
        store: Arc<dyn ArtifactStore>,
        validator: Validator,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            scheduler,
            store,
            validator,
            findings: FindingSet::new(),
            refinement: BTreeMap::new(),
            options,
            halted: false,
            cancelled: false,
        }
    }

    /// Carry over refinement history from a checkpoint.
    pub fn with_refinement_history(mut self, history: BTreeMap<NodeId, RefinementRecord>) -> Self {
        self.refinement = history;
        self
    }

    /// Rebuild a core from a checkpoint of a run of `pipeline`.
    ///
    /// Findings are recomputed from the restored store.
    pub fn from_checkpoint(
        pipeline: &PipelineFile,
        checkpoint: &RunCheckpoint,
        options: RuntimeOptions,
    ) -> Result<Self> {
        let mut scheduler = Scheduler::from_pipeline(pipeline, checkpoint.run_id.clone())?;
        scheduler.restore(&checkpoint.nodes);
        let store: Arc<dyn ArtifactStore> =
            Arc::new(MemoryArtifactStore::from_history(checkpoint.store.clone()));

        let mut core = Self::new(scheduler, store, Validator::new(pipeline.rule.clone()), options)
            .with_refinement_history(checkpoint.refinement.clone());
        core.full_sweep();
        Ok(core)
    }

    /// Apply a human resume to a core that has not started yet, e.g. one
    /// just rebuilt from a checkpoint. Dependents are released by `start`.
    pub fn accept_resume(
        &mut self,
        node: &str,
        payload: BTreeMap<FieldName, Value>,
    ) -> Result<()> {
        self.commit_human_input(node, payload)?;
        self.scheduler.complete_gate(node)
    }

    pub fn run_id(&self) -> &RunId {
        self.scheduler.run_id()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn findings(&self) -> &FindingSet {
        &self.findings
    }

    pub fn node_state(&self, node: &str) -> Option<NodeState> {
        self.scheduler.node_state(node)
    }

    /// Seed the run: sweep every rule once, then promote and dispatch
    /// whatever is already resolvable.
    pub fn start(&mut self) -> CoreStep {
        self.full_sweep();
        let snapshot = self.store.snapshot();
        let step = self.scheduler.step_start(&snapshot);

        let mut commands = Vec::new();
        self.rearm_restored_gates(&step, &mut commands);
        self.absorb(step, &mut commands);
        self.conclude(commands, true)
    }

    /// Handle a single runtime event, updating core state and returning the
    /// resulting commands for the IO shell.
    pub fn step(&mut self, event: RuntimeEvent) -> CoreStep {
        match event {
            RuntimeEvent::NodeCompleted {
                node,
                attempt,
                written,
                refinement,
            } => self.on_node_completed(&node, attempt, &written, refinement),
            RuntimeEvent::NodeFailed {
                node,
                attempt,
                error,
            } => self.on_node_failed(&node, attempt, &error),
            RuntimeEvent::HumanResumed {
                node,
                payload,
                reply,
            } => match self.on_resume(&node, payload) {
                Ok(step) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    step
                }
                Err(e) => {
                    warn!(node = %node, error = %e, "rejected human resume");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e));
                    }
                    CoreStep::continue_with(Vec::new())
                }
            },
            RuntimeEvent::FieldsAmended {
                document,
                fields,
                reply,
            } => {
                let step = self.on_amend(&document, fields);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                step
            }
            RuntimeEvent::GateTimedOut { node } => self.on_gate_timeout(&node),
            RuntimeEvent::CancelRequested => self.on_cancel(),
            RuntimeEvent::ShutdownRequested => self.on_shutdown(),
        }
    }

    /// Current report.
    pub fn report(&self) -> RunReport {
        let mut nodes: Vec<NodeReport> = self
            .scheduler
            .nodes()
            .map(|n| NodeReport {
                id: n.id.clone(),
                state: n.state,
                tier: n.tier,
                attempts: n.attempts,
                reason: n.reason.clone(),
                condition_result: n.condition_result,
            })
            .collect();
        nodes.sort_by(|a, b| (a.tier, &a.id).cmp(&(b.tier, &b.id)));

        RunReport {
            run_id: self.run_id().clone(),
            status: self.status(),
            generated_at: Utc::now(),
            nodes,
            findings: self.findings.all(),
            refinement: self.refinement.clone(),
            checkpoint_error: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.scheduler.is_finished() {
            if self.cancelled {
                RunStatus::Cancelled
            } else if self.halted {
                RunStatus::Halted
            } else {
                RunStatus::Completed
            }
        } else if self.scheduler.is_quiescent()
            && !self.scheduler.nodes_in(NodeState::AwaitingHuman).is_empty()
        {
            RunStatus::AwaitingHuman
        } else {
            RunStatus::Running
        }
    }

    /// Durable snapshot of the run.
    pub fn checkpoint(&self) -> RunCheckpoint {
        debug!(run_id = %self.run_id(), "building checkpoint");
        RunCheckpoint {
            run_id: self.run_id().clone(),
            saved_at: Utc::now(),
            nodes: self.scheduler.checkpoint_nodes(),
            refinement: self.refinement.clone(),
            store: self.store.export(),
        }
    }
}
