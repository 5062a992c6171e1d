// src/store/checkpoint.rs

//! Durable run checkpoints.
//!
//! A checkpoint is written to `<state_dir>/<run_id>.json` after every
//! scheduler step that changed state. The file holds a digest line followed
//! by the JSON body:
//!
//! ```text
//! blake3:<hex digest of the body>
//! { "run_id": ..., "nodes": ..., "store": ..., ... }
//! ```
//!
//! A body whose digest does not match is rejected on load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dag::NodeState;
use crate::engine::{NodeId, RunId};
use crate::errors::{DocdagError, Result};
use crate::fs::FileSystem;
use crate::generation::RefinementRecord;

use super::StoreHistory;

const DIGEST_PREFIX: &str = "blake3:";
const EXTENSION: &str = "json";

/// Saved state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCheckpoint {
    pub state: NodeState,
    pub attempts: u32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub condition_result: Option<bool>,
    #[serde(default)]
    pub awaiting_since: Option<DateTime<Utc>>,
}

/// Everything needed to continue a run in a new process.
///
/// Findings are not saved; they are recomputed from the restored store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: RunId,
    pub saved_at: DateTime<Utc>,
    pub nodes: BTreeMap<NodeId, NodeCheckpoint>,
    #[serde(default)]
    pub refinement: BTreeMap<NodeId, RefinementRecord>,
    pub store: StoreHistory,
}

/// Reads and writes checkpoints through a [`FileSystem`].
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.{EXTENSION}"))
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.fs.is_file(&self.path_for(run_id))
    }

    pub fn save(&self, checkpoint: &RunCheckpoint) -> Result<()> {
        let body = serde_json::to_string_pretty(checkpoint)?;
        let digest = blake3::hash(body.as_bytes()).to_hex();
        let contents = format!("{DIGEST_PREFIX}{digest}\n{body}");

        let path = self.path_for(&checkpoint.run_id);
        self.fs.write(&path, contents.as_bytes())?;
        debug!(
            run_id = %checkpoint.run_id,
            path = %path.display(),
            bytes = contents.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<RunCheckpoint> {
        let path = self.path_for(run_id);
        if !self.fs.is_file(&path) {
            return Err(DocdagError::UnknownRun(run_id.to_string()));
        }

        let contents = self.fs.read_to_string(&path)?;
        let (header, body) = contents.split_once('\n').ok_or_else(|| {
            DocdagError::Config(format!("checkpoint {} is truncated", path.display()))
        })?;
        let expected = header.strip_prefix(DIGEST_PREFIX).ok_or_else(|| {
            DocdagError::Config(format!(
                "checkpoint {} has no digest header",
                path.display()
            ))
        })?;
        let actual = blake3::hash(body.as_bytes()).to_hex();
        if actual.as_str() != expected.trim() {
            return Err(DocdagError::Config(format!(
                "checkpoint {} failed its integrity check",
                path.display()
            )));
        }

        let checkpoint: RunCheckpoint = serde_json::from_str(body)?;
        info!(run_id = %run_id, nodes = checkpoint.nodes.len(), "checkpoint loaded");
        Ok(checkpoint)
    }

    /// Ids of every run with a checkpoint in the state directory.
    pub fn list(&self) -> Result<Vec<RunId>> {
        if !self.fs.is_dir(&self.dir) {
            return Ok(Vec::new());
        }
        let mut runs: Vec<RunId> = self
            .fs
            .read_dir(&self.dir)?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|e| e == EXTENSION))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .collect();
        runs.sort();
        Ok(runs)
    }
}
