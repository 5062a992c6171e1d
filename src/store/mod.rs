// src/store/mod.rs

//! Shared artifact store.
//!
//! Every node output lands here, addressed by `(document id, field)`. Writes
//! append a new [`Version`] carrying [`Provenance`]; nothing is overwritten
//! in place. The current value of a field is its latest version.
//!
//! - [`memory`] holds the in-process implementation used by the runtime.
//! - [`checkpoint`] persists store history plus scheduler state so a process
//!   restart does not lose completed node output.

pub mod checkpoint;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::NodeId;

pub use checkpoint::{CheckpointStore, NodeCheckpoint, RunCheckpoint};
pub use memory::MemoryArtifactStore;

pub type DocumentId = String;
pub type FieldName = String;

/// Provenance node id used for initial inputs supplied at run start.
pub const INITIAL_INPUT_NODE: &str = "input";

/// Who wrote a version, and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub node_id: NodeId,
    pub attempt: u32,
    /// Refinement iteration that produced this version, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl Provenance {
    pub fn new(node_id: impl Into<NodeId>, attempt: u32) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            iteration: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }
}

/// One entry in a field's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub value: Value,
    pub provenance: Provenance,
    /// blake3 digest of the canonical JSON encoding of `value`.
    pub digest: String,
}

impl Version {
    pub fn new(value: Value, provenance: Provenance) -> Self {
        let digest = value_digest(&value);
        Self {
            value,
            provenance,
            digest,
        }
    }
}

/// Compute the content digest recorded alongside each version.
pub fn value_digest(value: &Value) -> String {
    let bytes = value.to_string();
    blake3::hash(bytes.as_bytes()).to_hex().to_string()
}

/// Full history of every document, as exported for checkpoints.
pub type StoreHistory = BTreeMap<DocumentId, BTreeMap<FieldName, Vec<Version>>>;

/// Address of a single field, written `"Document.field"` in definitions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldRef {
    pub document: DocumentId,
    pub field: FieldName,
}

impl FieldRef {
    pub fn new(document: impl Into<DocumentId>, field: impl Into<FieldName>) -> Self {
        Self {
            document: document.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.document, self.field)
    }
}

impl FromStr for FieldRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once('.') {
            Some((doc, field)) if !doc.is_empty() && !field.is_empty() => {
                Ok(FieldRef::new(doc, field))
            }
            _ => Err(format!(
                "invalid field reference '{s}' (expected \"Document.field\")"
            )),
        }
    }
}

impl TryFrom<String> for FieldRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FieldRef> for String {
    fn from(r: FieldRef) -> Self {
        r.to_string()
    }
}

/// Consistent, read-only view of the current value of every field.
///
/// Built by copying under the per-document locks, so a snapshot never shows
/// half of a multi-field commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    documents: BTreeMap<DocumentId, BTreeMap<FieldName, Value>>,
}

impl StoreSnapshot {
    pub fn from_documents(documents: BTreeMap<DocumentId, BTreeMap<FieldName, Value>>) -> Self {
        Self { documents }
    }

    pub fn get(&self, document: &str, field: &str) -> Option<&Value> {
        self.documents.get(document).and_then(|d| d.get(field))
    }

    pub fn get_ref(&self, field: &FieldRef) -> Option<&Value> {
        self.get(&field.document, &field.field)
    }

    pub fn document(&self, document: &str) -> Option<&BTreeMap<FieldName, Value>> {
        self.documents.get(document)
    }

    pub fn documents(&self) -> impl Iterator<Item = (&DocumentId, &BTreeMap<FieldName, Value>)> {
        self.documents.iter()
    }
}

/// Whether a value counts as "present" for existence checks.
pub fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Injectable store interface used by the engine.
///
/// Implementations must serialise writes per document and must never
/// overwrite a version in place.
pub trait ArtifactStore: Send + Sync + Debug {
    /// Latest value of a field. A latest version of `null` retracts the
    /// field: it reads as absent here and in snapshots, while `history`
    /// keeps every version.
    fn read(&self, document: &str, field: &str) -> Option<Value>;

    /// Every version of a field, oldest first.
    fn history(&self, document: &str, field: &str) -> Vec<Version>;

    /// Append a single field version.
    fn write(&self, document: &str, field: &str, value: Value, provenance: Provenance);

    /// Append several fields of one document as a single commit.
    fn commit(
        &self,
        document: &str,
        fields: BTreeMap<FieldName, Value>,
        provenance: Provenance,
    );

    /// Consistent copy of the latest value of every field.
    fn snapshot(&self) -> StoreSnapshot;

    /// Full history, for checkpoints.
    fn export(&self) -> StoreHistory;
}
