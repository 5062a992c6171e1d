// src/config/mod.rs

//! Pipeline definitions.
//!
//! - [`model`] holds the raw and validated TOML shapes.
//! - [`validate`] turns a `RawPipelineFile` into a `PipelineFile`.
//! - [`loader`] reads definitions and initial inputs from disk.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{InitialInputs, load_and_validate};
pub use model::{NodeConfig, PipelineFile, RawPipelineFile};
