// src/errors.rs

//! Crate-wide error types.
//!
//! [`DocdagError`] covers failures of the engine itself (bad definitions,
//! IO, unknown runs). [`NodeError`] covers failures of a single node; those
//! are recorded against the node and never abort a run.

use thiserror::Error;

use crate::engine::NodeId;

#[derive(Error, Debug)]
pub enum DocdagError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The node/edge definition is not a DAG. Carries the nodes that Kahn's
    /// algorithm could not order.
    #[error("Cycle detected in pipeline graph: {}", .0.join(", "))]
    Cycle(Vec<NodeId>),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node '{node}' is not awaiting human input (state: {state})")]
    NotAwaitingHuman { node: NodeId, state: String },

    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, DocdagError>;

/// Whether a collaborator failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationErrorKind {
    Retryable,
    Permanent,
}

/// Failure reported by the generation collaborator or the quality assessor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} generation error: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: GenerationErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: GenerationErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == GenerationErrorKind::Retryable
    }
}

/// Node-level failure. Marks the node Failed; dependents become Blocked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("node '{node}' is missing required input '{source_node}.{field}'")]
    MissingInput {
        node: NodeId,
        source_node: NodeId,
        field: String,
    },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("cancelled")]
    Cancelled,

    #[error("human gate on node '{node}' timed out")]
    HumanGateTimeout { node: NodeId },
}

impl NodeError {
    /// Whether the scheduler may spend a node retry on this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Generation(e) => e.is_retryable(),
            NodeError::MissingInput { .. }
            | NodeError::Cancelled
            | NodeError::HumanGateTimeout { .. } => false,
        }
    }
}
