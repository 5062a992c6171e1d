// src/store/memory.rs

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value;
use tracing::debug;

use super::{
    ArtifactStore, DocumentId, FieldName, Provenance, StoreHistory, StoreSnapshot, Version,
};

/// Field histories of a single document.
#[derive(Debug, Default)]
struct Document {
    fields: BTreeMap<FieldName, Vec<Version>>,
}

/// In-memory append-only store.
///
/// The outer map is only write-locked to create a new document; field writes
/// take the document's own mutex, so concurrent commits to different
/// documents do not contend and commits to the same document are serialised.
/// Versions are never mutated once appended, so a poisoned lock still guards
/// consistent data and is recovered rather than propagated.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    documents: RwLock<BTreeMap<DocumentId, Arc<Mutex<Document>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from exported history (checkpoint restore).
    pub fn from_history(history: StoreHistory) -> Self {
        let documents = history
            .into_iter()
            .map(|(id, fields)| (id, Arc::new(Mutex::new(Document { fields }))))
            .collect();
        Self {
            documents: RwLock::new(documents),
        }
    }

    fn document(&self, document: &str) -> Option<Arc<Mutex<Document>>> {
        let docs = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        docs.get(document).cloned()
    }

    fn document_or_create(&self, document: &str) -> Arc<Mutex<Document>> {
        if let Some(doc) = self.document(document) {
            return doc;
        }
        let mut docs = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        docs.entry(document.to_string()).or_default().clone()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn read(&self, document: &str, field: &str) -> Option<Value> {
        let doc = self.document(document)?;
        let guard = doc.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .fields
            .get(field)
            .and_then(|h| h.last())
            .filter(|v| !v.value.is_null())
            .map(|v| v.value.clone())
    }

    fn history(&self, document: &str, field: &str) -> Vec<Version> {
        let Some(doc) = self.document(document) else {
            return Vec::new();
        };
        let guard = doc.lock().unwrap_or_else(PoisonError::into_inner);
        guard.fields.get(field).cloned().unwrap_or_default()
    }

    fn write(&self, document: &str, field: &str, value: Value, provenance: Provenance) {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), value);
        self.commit(document, fields, provenance);
    }

    fn commit(
        &self,
        document: &str,
        fields: BTreeMap<FieldName, Value>,
        provenance: Provenance,
    ) {
        if fields.is_empty() {
            return;
        }

        let doc = self.document_or_create(document);
        let mut guard = doc.lock().unwrap_or_else(PoisonError::into_inner);

        debug!(
            document = %document,
            node = %provenance.node_id,
            attempt = provenance.attempt,
            iteration = ?provenance.iteration,
            fields = fields.len(),
            "store: appending versions"
        );

        for (field, value) in fields {
            guard
                .fields
                .entry(field)
                .or_default()
                .push(Version::new(value, provenance.clone()));
        }
    }

    fn snapshot(&self) -> StoreSnapshot {
        let docs = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = BTreeMap::new();

        for (id, doc) in docs.iter() {
            let guard = doc.lock().unwrap_or_else(PoisonError::into_inner);
            let current: BTreeMap<FieldName, Value> = guard
                .fields
                .iter()
                .filter_map(|(field, history)| {
                    history
                        .last()
                        .filter(|v| !v.value.is_null())
                        .map(|v| (field.clone(), v.value.clone()))
                })
                .collect();
            if !current.is_empty() {
                out.insert(id.clone(), current);
            }
        }

        StoreSnapshot::from_documents(out)
    }

    fn export(&self) -> StoreHistory {
        let docs = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        docs.iter()
            .map(|(id, doc)| {
                let guard = doc.lock().unwrap_or_else(PoisonError::into_inner);
                (id.clone(), guard.fields.clone())
            })
            .collect()
    }
}
