use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use docdag::dag::ScheduledNode;
use docdag::engine::RuntimeEvent;
use docdag::errors::{NodeError, Result};
use docdag::exec::ExecutorBackend;
use docdag::store::{ArtifactStore, FieldRef, Provenance};

/// A fake executor that:
/// - records which nodes were "run", in dispatch order
/// - commits a `content` field (plus any scripted fields) for each node
/// - immediately reports NodeCompleted, or NodeFailed for scripted failures.
pub struct FakeExecutor {
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    store: Arc<dyn ArtifactStore>,
    executed: Arc<Mutex<Vec<String>>>,
    fields: HashMap<String, BTreeMap<String, Value>>,
    failures: HashMap<String, NodeError>,
    cancelled: Arc<Mutex<bool>>,
}

impl FakeExecutor {
    pub fn new(
        runtime_tx: mpsc::Sender<RuntimeEvent>,
        store: Arc<dyn ArtifactStore>,
        executed: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self {
            runtime_tx,
            store,
            executed,
            fields: HashMap::new(),
            failures: HashMap::new(),
            cancelled: Arc::new(Mutex::new(false)),
        }
    }

    /// Extra fields committed when `node` runs.
    pub fn with_fields(mut self, node: &str, fields: &[(&str, Value)]) -> Self {
        self.fields.insert(
            node.to_string(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        );
        self
    }

    /// Report `error` instead of completing `node`.
    pub fn failing(mut self, node: &str, error: NodeError) -> Self {
        self.failures.insert(node.to_string(), error);
        self
    }

    pub fn cancelled_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.cancelled)
    }
}

impl ExecutorBackend for FakeExecutor {
    fn dispatch(
        &mut self,
        nodes: Vec<ScheduledNode>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let tx = self.runtime_tx.clone();
        let mut events = Vec::new();

        for n in nodes {
            self.executed.lock().unwrap().push(n.id.clone());

            if let Some(error) = self.failures.get(&n.id) {
                events.push(RuntimeEvent::NodeFailed {
                    node: n.id.clone(),
                    attempt: n.attempt,
                    error: error.clone(),
                });
                continue;
            }

            let mut fields = self.fields.get(&n.id).cloned().unwrap_or_default();
            fields.insert("content".to_string(), Value::String(format!("{} draft", n.id)));
            let written = fields
                .keys()
                .map(|f| FieldRef::new(n.id.clone(), f.clone()))
                .collect();
            self.store
                .commit(&n.id, fields, Provenance::new(n.id.clone(), n.attempt));

            events.push(RuntimeEvent::NodeCompleted {
                node: n.id.clone(),
                attempt: n.attempt,
                written,
                refinement: None,
            });
        }

        Box::pin(async move {
            for event in events {
                tx.send(event).await.map_err(|e| anyhow::anyhow!("{e}"))?;
            }
            Ok(())
        })
    }

    fn cancel_all(&mut self) {
        *self.cancelled.lock().unwrap() = true;
    }
}
