// src/exec/mod.rs

//! Node execution layer.
//!
//! This module is responsible for actually running scheduled nodes and
//! reporting back to the orchestration runtime via `RuntimeEvent`s.
//!
//! - [`node_runner`] runs one node: input projection, draft, refinement.
//! - [`retry`] holds the bounded backoff policy and cancellation flags.
//! - [`command`] provides collaborators backed by shell commands.
//! - [`backend`] provides the `ExecutorBackend` trait and a concrete
//!   `RealExecutorBackend` that the runtime uses in production, and which
//!   tests can replace with a fake implementation.

pub mod backend;
pub mod command;
pub mod node_runner;
pub mod retry;

pub use backend::{ExecutorBackend, RealExecutorBackend};
pub use command::{CommandAssessor, CommandCollaborator};
pub use node_runner::NodeRunner;
pub use retry::{CancelFlag, RetryPolicy};
