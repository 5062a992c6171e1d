// src/generation/mod.rs

//! Drafting and quality assessment.
//!
//! The engine does not write documents itself. It calls two external
//! capabilities through the traits defined here:
//!
//! - [`GenerationCollaborator`] drafts a node's content from its input
//!   context.
//! - [`QualityAssessor`] scores a draft and lists its issues.
//!
//! [`invoker`] assembles input contexts from the store, calls the
//! collaborator with retries and commits the result. [`refinement`] drives
//! the assess/redraft loop on top of it.

pub mod invoker;
pub mod refinement;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::NodeId;
use crate::errors::GenerationError;
use crate::types::HallucinationRisk;

pub use invoker::{GenerationInvoker, InvocationOutcome};
pub use refinement::{
    RefinementController, RefinementIteration, RefinementOutcome, RefinementRecord, StopReason,
};

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything a collaborator sees when drafting one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    pub node_id: NodeId,
    pub attempt: u32,
    /// Projected inputs, keyed by data-source alias. Each value is an object
    /// of the projected fields.
    pub inputs: BTreeMap<String, Value>,
    /// Fields the node is expected to produce.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_fields: Vec<String>,
    /// Set on redrafts: refinement iteration being produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_draft: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<AssessmentIssue>,
}

impl InputContext {
    pub fn new(node_id: impl Into<NodeId>, attempt: u32) -> Self {
        Self {
            node_id: node_id.into(),
            attempt,
            inputs: BTreeMap::new(),
            output_fields: Vec::new(),
            iteration: None,
            prior_draft: None,
            issues: Vec::new(),
        }
    }

    /// Context for a redraft: same inputs plus the prior draft and its issues.
    pub fn for_redraft(&self, iteration: u32, prior_draft: &str, issues: &[AssessmentIssue]) -> Self {
        Self {
            iteration: Some(iteration),
            prior_draft: Some(prior_draft.to_string()),
            issues: issues.to_vec(),
            ..self.clone()
        }
    }
}

/// Collaborator response for one draft.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub draft_content: String,
    #[serde(default)]
    pub extracted_fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub citations: Vec<String>,
}

impl GenerationOutput {
    pub fn new(draft_content: impl Into<String>) -> Self {
        Self {
            draft_content: draft_content.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extracted_fields.insert(name.into(), value.into());
        self
    }

    pub fn with_citation(mut self, citation: impl Into<String>) -> Self {
        self.citations.push(citation.into());
        self
    }
}

/// One problem reported by the quality assessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentIssue {
    pub category: String,
    pub detail: String,
}

impl AssessmentIssue {
    pub fn new(category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            detail: detail.into(),
        }
    }
}

/// Quality assessor verdict on a draft. `score` is clamped to `0..=100`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    pub score: u8,
    pub hallucination_risk: HallucinationRisk,
    #[serde(default)]
    pub issues: Vec<AssessmentIssue>,
}

impl Assessment {
    pub fn new(score: u8, hallucination_risk: HallucinationRisk) -> Self {
        Self {
            score: score.min(100),
            hallucination_risk,
            issues: Vec::new(),
        }
    }

    pub fn with_issue(mut self, category: impl Into<String>, detail: impl Into<String>) -> Self {
        self.issues.push(AssessmentIssue::new(category, detail));
        self
    }
}

/// External drafting capability.
pub trait GenerationCollaborator: Send + Sync + Debug {
    fn invoke<'a>(
        &'a self,
        node_id: &'a str,
        context: &'a InputContext,
    ) -> BoxFuture<'a, Result<GenerationOutput, GenerationError>>;
}

/// External scoring capability used by the refinement loop.
pub trait QualityAssessor: Send + Sync + Debug {
    fn assess<'a>(
        &'a self,
        content: &'a str,
        context: &'a InputContext,
    ) -> BoxFuture<'a, Result<Assessment, GenerationError>>;
}
