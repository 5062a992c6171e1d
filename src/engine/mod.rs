// src/engine/mod.rs

//! Orchestration engine for docdag.
//!
//! This module ties together:
//! - the pipeline scheduler
//! - the artifact store and the cross-reference validator
//! - the main runtime event loop that reacts to:
//!   - node completion and failure events from workers
//!   - human gate resumes and external field amendments
//!   - gate timeouts, cancellation and shutdown signals
//!
//! The pure core state machine lives in [`core`]; the async/IO shell is
//! implemented in [`runtime`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::errors::{NodeError, Result};
use crate::generation::RefinementRecord;
use crate::store::{DocumentId, FieldName, FieldRef};

/// Canonical node id type used throughout the engine. Node ids double as
/// the document ids their output is stored under.
pub type NodeId = String;

/// Run identifier (a v4 UUID in string form).
pub type RunId = String;

/// Reply channel for events that can be rejected.
pub type Reply = oneshot::Sender<Result<()>>;

/// Runtime options used by both the core and the async shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// Stop dispatching once an `error` finding is reported.
    pub halt_on_error: bool,
    /// Exit the runtime once nothing can progress without a human resume,
    /// leaving the run suspended in its checkpoint (used by the CLI).
    pub exit_when_quiescent: bool,
}

/// Events flowing into the runtime from workers, timers and the control
/// surface.
#[derive(Debug)]
pub enum RuntimeEvent {
    /// A worker committed a node's output.
    NodeCompleted {
        node: NodeId,
        attempt: u32,
        written: Vec<FieldRef>,
        refinement: Option<RefinementRecord>,
    },
    /// A worker gave up on a node.
    NodeFailed {
        node: NodeId,
        attempt: u32,
        error: NodeError,
    },
    /// Human-authored payload for an AwaitingHuman node.
    HumanResumed {
        node: NodeId,
        payload: BTreeMap<FieldName, Value>,
        reply: Option<Reply>,
    },
    /// External write to the store outside any node.
    FieldsAmended {
        document: DocumentId,
        fields: BTreeMap<FieldName, Value>,
        reply: Option<Reply>,
    },
    /// A human gate timer expired.
    GateTimedOut { node: NodeId },
    /// Cooperative cancellation of the whole run.
    CancelRequested,
    /// Graceful shutdown requested (e.g. Ctrl-C). The run stays resumable.
    ShutdownRequested,
}

pub mod core;
pub mod event_handlers;
pub mod runtime;

pub use core::CoreRuntime;
pub use event_handlers::{CoreCommand, CoreStep};
pub use runtime::Runtime;

/// How long a restored gate still has to wait, given when it started.
pub(crate) fn remaining_gate_time(
    timeout: Duration,
    since: Option<chrono::DateTime<chrono::Utc>>,
) -> Duration {
    let Some(since) = since else {
        return timeout;
    };
    let elapsed = (chrono::Utc::now() - since).to_std().unwrap_or(Duration::ZERO);
    timeout.saturating_sub(elapsed)
}
