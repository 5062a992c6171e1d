// src/generation/invoker.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::dag::ScheduledNode;
use crate::errors::NodeError;
use crate::exec::retry::{CancelFlag, RetryPolicy, with_retry};
use crate::store::{ArtifactStore, FieldName, FieldRef, Provenance, StoreSnapshot};

use super::{GenerationCollaborator, GenerationOutput, InputContext};

/// Store field holding a node's draft text.
pub const CONTENT_FIELD: &str = "content";
/// Store field holding a node's citation list.
pub const CITATIONS_FIELD: &str = "citations";

/// A committed draft.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub output: GenerationOutput,
    /// Fields appended to the store by this draft.
    pub written: Vec<FieldRef>,
}

/// Assembles input contexts, calls the collaborator and commits drafts.
#[derive(Debug, Clone)]
pub struct GenerationInvoker {
    collaborator: Arc<dyn GenerationCollaborator>,
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
}

impl GenerationInvoker {
    pub fn new(
        collaborator: Arc<dyn GenerationCollaborator>,
        store: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            collaborator,
            store,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Project the node's `data_sources` out of `snapshot`.
    ///
    /// A source with no field list projects the whole document. Absent
    /// required inputs fail with [`NodeError::MissingInput`]; absent
    /// optional ones are left out of the context.
    pub fn build_context(
        &self,
        node: &ScheduledNode,
        snapshot: &StoreSnapshot,
    ) -> Result<InputContext, NodeError> {
        let mut context = InputContext::new(node.id.clone(), node.attempt);
        context.output_fields = node.output_fields.clone();

        for (alias, source) in &node.data_sources {
            let document = snapshot.document(&source.node);
            let mut projected = Map::new();

            if source.fields.is_empty() {
                match document {
                    Some(doc) => {
                        projected.extend(doc.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    None if source.required => {
                        return Err(NodeError::MissingInput {
                            node: node.id.clone(),
                            source_node: source.node.clone(),
                            field: "*".to_string(),
                        });
                    }
                    None => continue,
                }
            } else {
                for field in &source.fields {
                    match document.and_then(|d| d.get(field)) {
                        Some(value) => {
                            projected.insert(field.clone(), value.clone());
                        }
                        None if source.required => {
                            return Err(NodeError::MissingInput {
                                node: node.id.clone(),
                                source_node: source.node.clone(),
                                field: field.clone(),
                            });
                        }
                        None => {}
                    }
                }
            }

            context.inputs.insert(alias.clone(), Value::Object(projected));
        }

        debug!(node = %node.id, inputs = context.inputs.len(), "assembled input context");
        Ok(context)
    }

    /// Call the collaborator (with retries) and commit the draft.
    ///
    /// `iteration` is recorded in provenance for drafts produced inside the
    /// refinement loop.
    pub async fn draft(
        &self,
        node: &ScheduledNode,
        context: &InputContext,
        iteration: Option<u32>,
        cancel: &CancelFlag,
    ) -> Result<InvocationOutcome, NodeError> {
        let collaborator = &self.collaborator;
        let output = with_retry(&self.retry, cancel, &node.id, |call| {
            debug!(node = %node.id, call, iteration = ?iteration, "invoking generation collaborator");
            collaborator.invoke(&node.id, context)
        })
        .await?;

        let missing: Vec<&String> = node
            .output_fields
            .iter()
            .filter(|f| !output.extracted_fields.contains_key(f.as_str()))
            .collect();
        if !missing.is_empty() {
            warn!(node = %node.id, ?missing, "draft did not extract every declared output field");
        }

        let written = self.commit(node, iteration, &output);
        info!(
            node = %node.id,
            attempt = node.attempt,
            iteration = ?iteration,
            fields = written.len(),
            "committed draft"
        );
        Ok(InvocationOutcome { output, written })
    }

    /// Append a draft's content, citations and extracted fields as one
    /// commit to the node's document.
    pub fn commit(
        &self,
        node: &ScheduledNode,
        iteration: Option<u32>,
        output: &GenerationOutput,
    ) -> Vec<FieldRef> {
        self.commit_replacing(node, iteration, output, &[])
    }

    /// Like [`commit`](Self::commit), but also retracts every field of the
    /// node's document in `previous` that `output` does not carry, so the
    /// document ends up holding exactly this draft.
    pub fn commit_replacing(
        &self,
        node: &ScheduledNode,
        iteration: Option<u32>,
        output: &GenerationOutput,
        previous: &[FieldRef],
    ) -> Vec<FieldRef> {
        let mut fields: BTreeMap<FieldName, Value> = output.extracted_fields.clone();
        fields.insert(
            CONTENT_FIELD.to_string(),
            Value::String(output.draft_content.clone()),
        );
        fields.insert(
            CITATIONS_FIELD.to_string(),
            Value::Array(
                output
                    .citations
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );

        for stale in previous.iter().filter(|f| f.document == node.id) {
            fields.entry(stale.field.clone()).or_insert(Value::Null);
        }

        let written = fields
            .keys()
            .map(|f| FieldRef::new(node.id.clone(), f.clone()))
            .collect();

        let mut provenance = Provenance::new(node.id.clone(), node.attempt);
        if let Some(i) = iteration {
            provenance = provenance.with_iteration(i);
        }
        self.store.commit(&node.id, fields, provenance);
        written
    }
}
