// src/exec/node_runner.rs

//! Runs a single scheduled node: input projection, first draft, and the
//! optional refinement loop.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::model::RefinementSection;
use crate::dag::ScheduledNode;
use crate::engine::RuntimeEvent;
use crate::errors::NodeError;
use crate::generation::{
    GenerationInvoker, QualityAssessor, RefinementController, RefinementRecord,
};
use crate::store::FieldRef;

use super::retry::CancelFlag;

/// Executes nodes on behalf of an executor backend.
#[derive(Debug, Clone)]
pub struct NodeRunner {
    invoker: GenerationInvoker,
    assessor: Option<Arc<dyn QualityAssessor>>,
    refinement: RefinementSection,
}

impl NodeRunner {
    pub fn new(
        invoker: GenerationInvoker,
        assessor: Option<Arc<dyn QualityAssessor>>,
        refinement: RefinementSection,
    ) -> Self {
        Self {
            invoker,
            assessor,
            refinement,
        }
    }

    pub fn invoker(&self) -> &GenerationInvoker {
        &self.invoker
    }

    /// Run `node` to completion and describe the result as a runtime event.
    ///
    /// Every dispatched node produces exactly one event, cancelled ones
    /// included: a cancelled node reports `NodeFailed` with
    /// [`NodeError::Cancelled`].
    pub async fn execute(&self, node: ScheduledNode, cancel: CancelFlag) -> RuntimeEvent {
        info!(
            node = %node.id,
            run_id = %node.run_id,
            attempt = node.attempt,
            tier = node.tier,
            "starting node"
        );

        match self.execute_inner(&node, &cancel).await {
            Ok((written, refinement)) => {
                info!(
                    node = %node.id,
                    attempt = node.attempt,
                    fields = written.len(),
                    refined = refinement.is_some(),
                    "node finished"
                );
                RuntimeEvent::NodeCompleted {
                    node: node.id,
                    attempt: node.attempt,
                    written,
                    refinement,
                }
            }
            Err(err) => {
                error!(
                    node = %node.id,
                    attempt = node.attempt,
                    error = %err,
                    "node execution failed"
                );
                RuntimeEvent::NodeFailed {
                    node: node.id,
                    attempt: node.attempt,
                    error: err,
                }
            }
        }
    }

    async fn execute_inner(
        &self,
        node: &ScheduledNode,
        cancel: &CancelFlag,
    ) -> Result<(Vec<FieldRef>, Option<RefinementRecord>), NodeError> {
        cancel.check()?;

        // Inputs are read as of dispatch time.
        let snapshot = self.invoker.store().snapshot();
        let context = self.invoker.build_context(node, &snapshot)?;

        let first = self.invoker.draft(node, &context, None, cancel).await?;
        if !node.refine {
            return Ok((first.written, None));
        }

        let Some(assessor) = &self.assessor else {
            warn!(node = %node.id, "refinement requested but no assessor configured; keeping first draft");
            return Ok((first.written, None));
        };

        debug!(node = %node.id, "entering refinement loop");
        let controller = RefinementController::new(&self.invoker, assessor.as_ref(), self.refinement);
        let outcome = controller.run(node, &context, first.output, cancel).await?;

        let mut written = first.written;
        written.extend(outcome.written);
        written.sort();
        written.dedup();
        Ok((written, Some(outcome.record)))
    }
}
