// src/report.rs

//! Run reports.
//!
//! A [`RunReport`] is produced after every scheduler step (for `status`)
//! and once more when the run ends. Partial success is an ordinary report:
//! failed, blocked and skipped nodes are listed next to completed ones.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crossref::Finding;
use crate::dag::NodeState;
use crate::engine::{NodeId, RunId};
use crate::generation::RefinementRecord;
use crate::types::Severity;

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Nothing can progress until a human gate is resumed.
    AwaitingHuman,
    /// Every node reached a terminal state.
    Completed,
    /// Stopped after an `error` finding with `halt_on_error` set.
    Halted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub state: NodeState,
    pub tier: u32,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_result: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub generated_at: DateTime<Utc>,
    /// Sorted by tier, then id.
    pub nodes: Vec<NodeReport>,
    pub findings: Vec<Finding>,
    pub refinement: BTreeMap<NodeId, RefinementRecord>,
    /// Set when the latest checkpoint could not be written; the run carries
    /// on but cannot be resumed from disk past the last good checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_error: Option<String>,
}

impl RunReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn state_of(&self, id: &str) -> Option<NodeState> {
        self.node(id).map(|n| n.state)
    }

    pub fn nodes_in(&self, state: NodeState) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.state == state)
            .map(|n| n.id.as_str())
            .collect()
    }

    pub fn error_findings(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.severity == Severity::Error)
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            RunStatus::Completed | RunStatus::Halted | RunStatus::Cancelled
        )
    }

    /// Every node completed or skipped, and no `error` findings.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed
            && self
                .nodes
                .iter()
                .all(|n| matches!(n.state, NodeState::Completed | NodeState::Skipped))
            && self.error_findings().next().is_none()
    }

    /// Plain-text summary for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {} ({:?})", self.run_id, self.status);
        if let Some(e) = &self.checkpoint_error {
            let _ = writeln!(out, "checkpoint not saved: {e}");
        }

        let _ = writeln!(out, "nodes ({}):", self.nodes.len());
        for n in &self.nodes {
            let _ = write!(
                out,
                "  [tier {}] {:<24} {:<15} attempts={}",
                n.tier, n.id, n.state, n.attempts
            );
            if let Some(reason) = &n.reason {
                let _ = write!(out, "  ({reason})");
            }
            out.push('\n');
        }

        if !self.refinement.is_empty() {
            let _ = writeln!(out, "refinement:");
            for (id, record) in &self.refinement {
                let _ = writeln!(
                    out,
                    "  {id}: scores {:?}, stopped {:?}, accepted iteration {} ({:?})",
                    record.scores(),
                    record.stop_reason,
                    record.accepted_iteration,
                    record.policy
                );
            }
        }

        let _ = writeln!(out, "findings ({}):", self.findings.len());
        for f in &self.findings {
            let _ = writeln!(
                out,
                "  {:?} {} [{}]: {}",
                f.severity,
                f.rule_id,
                f.documents.join(", "),
                f.message
            );
        }
        out
    }
}
