// src/engine/event_handlers.rs

//! Event handling logic for the core runtime.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crossref::Finding;
use crate::dag::{NodeState, ScheduledNode, SchedulerStep};
use crate::engine::core::{CANCEL_REASON, CoreRuntime, HALT_REASON};
use crate::engine::{NodeId, remaining_gate_time};
use crate::errors::{DocdagError, NodeError, Result};
use crate::generation::RefinementRecord;
use crate::store::{FieldName, FieldRef, Provenance};

/// Provenance node id recorded for external amendments.
pub const AMENDMENT_NODE: &str = "external";

/// Command produced by the pure core, to be executed by the outer IO shell.
#[derive(Debug, Clone)]
pub enum CoreCommand {
    /// Send these nodes to the executor.
    Dispatch(Vec<ScheduledNode>),
    /// Emit `GateTimedOut { node }` after `after` unless resumed first.
    ArmGateTimer { node: NodeId, after: Duration },
    /// Raise the cancellation flag of every running node.
    CancelRunning,
    /// Persist a checkpoint of the current state.
    Checkpoint,
    /// Every node is terminal; the final report is ready.
    Finished,
}

/// Decision returned by the core after handling a single `RuntimeEvent`.
#[derive(Debug, Clone)]
pub struct CoreStep {
    /// Commands the IO shell should execute, in order.
    pub commands: Vec<CoreCommand>,
    /// Whether the outer runtime loop should keep running.
    pub keep_running: bool,
}

impl CoreStep {
    pub fn continue_with(commands: Vec<CoreCommand>) -> Self {
        Self {
            commands,
            keep_running: true,
        }
    }

    /// Nodes dispatched by this step.
    pub fn dispatched(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::Dispatch(nodes) => Some(nodes),
                _ => None,
            })
            .flatten()
            .map(|n| n.id.as_str())
            .collect()
    }
}

impl CoreRuntime {
    pub(super) fn on_node_completed(
        &mut self,
        node: &str,
        attempt: u32,
        written: &[FieldRef],
        refinement: Option<RefinementRecord>,
    ) -> CoreStep {
        debug!(node = %node, attempt, fields = written.len(), "node completed event");
        if let Some(record) = refinement {
            self.refinement.insert(node.to_string(), record);
        }

        self.validate_written(written);
        let snapshot = self.store.snapshot();
        let step = self.scheduler.step_completion(node, &snapshot);

        let mut commands = Vec::new();
        self.absorb(step, &mut commands);
        self.conclude(commands, true)
    }

    pub(super) fn on_node_failed(&mut self, node: &str, attempt: u32, error: &NodeError) -> CoreStep {
        debug!(node = %node, attempt, error = %error, "node failed event");
        let snapshot = self.store.snapshot();
        let step = self.scheduler.step_failure(node, error, &snapshot);

        let mut commands = Vec::new();
        self.absorb(step, &mut commands);
        self.conclude(commands, true)
    }

    /// Commit a human payload as the node's output, then complete the node.
    pub(super) fn on_resume(
        &mut self,
        node: &str,
        payload: BTreeMap<FieldName, Value>,
    ) -> Result<CoreStep> {
        self.commit_human_input(node, payload)?;
        let snapshot = self.store.snapshot();
        let step = self.scheduler.step_resume(node, &snapshot)?;

        let mut commands = Vec::new();
        self.absorb(step, &mut commands);
        Ok(self.conclude(commands, true))
    }

    /// Validate and commit a resume payload. The node itself is left
    /// AwaitingHuman; callers complete it.
    pub(super) fn commit_human_input(
        &mut self,
        node: &str,
        payload: BTreeMap<FieldName, Value>,
    ) -> Result<()> {
        self.scheduler.check_resumable(node)?;
        if payload.is_empty() {
            return Err(DocdagError::Config(format!(
                "resume payload for node '{node}' has no fields"
            )));
        }

        let attempt = self
            .scheduler
            .node(node)
            .map(|n| n.attempts + 1)
            .unwrap_or(1);
        let written: Vec<FieldRef> = payload
            .keys()
            .map(|f| FieldRef::new(node, f.clone()))
            .collect();
        self.store
            .commit(node, payload, Provenance::new(node, attempt));
        self.validate_written(&written);
        Ok(())
    }

    /// External write; only re-validation follows, no state change.
    pub(super) fn on_amend(
        &mut self,
        document: &str,
        fields: BTreeMap<FieldName, Value>,
    ) -> CoreStep {
        let written: Vec<FieldRef> = fields
            .keys()
            .map(|f| FieldRef::new(document, f.clone()))
            .collect();
        info!(document = %document, fields = written.len(), "external amendment");
        self.store
            .commit(document, fields, Provenance::new(AMENDMENT_NODE, 1));
        self.validate_written(&written);
        self.conclude(Vec::new(), true)
    }

    pub(super) fn on_gate_timeout(&mut self, node: &str) -> CoreStep {
        let snapshot = self.store.snapshot();
        let step = self.scheduler.step_gate_timeout(node, &snapshot);
        let changed = !step.newly_failed.is_empty();

        let mut commands = Vec::new();
        self.absorb(step, &mut commands);
        self.conclude(commands, changed)
    }

    pub(super) fn on_cancel(&mut self) -> CoreStep {
        info!(run_id = %self.run_id(), "cancellation requested");
        self.cancelled = true;
        let step = self.scheduler.step_stop(CANCEL_REASON);

        let mut commands = vec![CoreCommand::CancelRunning];
        self.absorb(step, &mut commands);
        self.conclude(commands, true)
    }

    pub(super) fn on_shutdown(&mut self) -> CoreStep {
        info!(run_id = %self.run_id(), "shutdown requested; run remains resumable");
        CoreStep {
            commands: vec![CoreCommand::Checkpoint],
            keep_running: false,
        }
    }

    /// Re-evaluate the rules touched by `written` and replace their findings.
    pub(super) fn validate_written(&mut self, written: &[FieldRef]) {
        if written.is_empty() {
            return;
        }
        let snapshot = self.store.snapshot();
        let outcome = self.validator.validate_incremental(&snapshot, written);

        let mut by_rule: BTreeMap<&str, Vec<Finding>> = outcome
            .evaluated
            .iter()
            .map(|id| (id.as_str(), Vec::new()))
            .collect();
        for finding in &outcome.findings {
            if let Some(list) = by_rule.get_mut(finding.rule_id.as_str()) {
                list.push(finding.clone());
            }
        }

        for (rule_id, findings) in by_rule {
            for f in findings.iter().filter(|f| f.is_error()) {
                warn!(
                    rule = %f.rule_id,
                    documents = ?f.documents,
                    message = %f.message,
                    "validation error finding"
                );
            }
            self.findings.replace(rule_id, findings);
        }
    }

    /// Evaluate every rule against the current store, replacing all
    /// findings.
    pub fn full_sweep(&mut self) {
        let snapshot = self.store.snapshot();
        for rule in self.validator.rules() {
            let findings = crate::crossref::validator::evaluate_rule(rule, &snapshot);
            self.findings.replace(&rule.id, findings);
        }
        debug!(
            findings = self.findings.all().len(),
            "full validation sweep"
        );
    }

    /// Turn a scheduler step into commands.
    pub(super) fn absorb(&mut self, step: SchedulerStep, commands: &mut Vec<CoreCommand>) {
        for node in &step.newly_skipped {
            info!(node = %node, "node skipped");
        }
        for node in &step.newly_blocked {
            info!(node = %node, "node blocked");
        }
        for awaiting in step.newly_awaiting {
            if let Some(after) = awaiting.timeout {
                commands.push(CoreCommand::ArmGateTimer {
                    node: awaiting.id,
                    after,
                });
            }
        }
        if !step.newly_scheduled.is_empty() {
            commands.push(CoreCommand::Dispatch(step.newly_scheduled));
        }
    }

    /// Gates restored from a checkpoint need their timers armed again, with
    /// whatever time they had left.
    pub(super) fn rearm_restored_gates(
        &self,
        step: &SchedulerStep,
        commands: &mut Vec<CoreCommand>,
    ) {
        for info in self.scheduler.nodes() {
            if info.state != NodeState::AwaitingHuman
                || step.newly_awaiting.iter().any(|a| a.id == info.id)
            {
                continue;
            }
            if let Some(timeout) = info.gate_timeout {
                commands.push(CoreCommand::ArmGateTimer {
                    node: info.id.clone(),
                    after: remaining_gate_time(timeout, info.awaiting_since),
                });
            }
        }
    }

    /// Apply the halt policy, then decide whether the loop continues.
    pub(super) fn conclude(&mut self, mut commands: Vec<CoreCommand>, changed: bool) -> CoreStep {
        if self.options.halt_on_error
            && !self.halted
            && !self.cancelled
            && self.findings.has_errors()
        {
            warn!(run_id = %self.run_id(), "error finding reported; halting run");
            self.halted = true;
            let step = self.scheduler.step_stop(HALT_REASON);
            commands.push(CoreCommand::CancelRunning);
            self.absorb(step, &mut commands);
        }

        if self.scheduler.is_finished() {
            self.full_sweep();
            let report = self.report();
            info!(
                run_id = %self.run_id(),
                status = ?report.status,
                findings = report.findings.len(),
                "run finished"
            );
            commands.push(CoreCommand::Checkpoint);
            commands.push(CoreCommand::Finished);
            return CoreStep {
                commands,
                keep_running: false,
            };
        }

        if changed {
            commands.push(CoreCommand::Checkpoint);
        }

        let quiescent = self.scheduler.is_quiescent();
        if quiescent && self.options.exit_when_quiescent {
            info!(
                run_id = %self.run_id(),
                awaiting = ?self.scheduler.nodes_in(NodeState::AwaitingHuman),
                "nothing can progress without a resume; suspending"
            );
            if !changed {
                commands.push(CoreCommand::Checkpoint);
            }
            return CoreStep {
                commands,
                keep_running: false,
            };
        }

        CoreStep::continue_with(commands)
    }
}
