// src/generation/refinement.rs

//! Assess/redraft loop run after a node's first successful draft.
//!
//! Each iteration asks the [`QualityAssessor`] for a score. The loop stops
//! when one of these holds, checked in order:
//!
//! 1. the score reached `target_score`;
//! 2. `max_iterations` assessments have been made;
//! 3. the score moved by `min_improvement` or less since the previous
//!    iteration.
//!
//! Otherwise the node is redrafted with the prior draft and the assessor's
//! issues as extra context. Which draft is accepted at the end is decided by
//! [`RefinementPolicy`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::model::RefinementSection;
use crate::dag::ScheduledNode;
use crate::engine::NodeId;
use crate::errors::NodeError;
use crate::exec::retry::{CancelFlag, with_retry};
use crate::store::FieldRef;
use crate::types::{HallucinationRisk, RefinementPolicy};

use super::{AssessmentIssue, GenerationInvoker, GenerationOutput, InputContext, QualityAssessor};

/// One assessment, and whether a redraft followed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementIteration {
    /// 0-based; iteration 0 assesses the first draft.
    pub iteration: u32,
    pub score: u8,
    /// Change against the previous iteration's score.
    pub delta: Option<i32>,
    pub hallucination_risk: HallucinationRisk,
    pub issues: Vec<AssessmentIssue>,
    pub redrafted: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    MaxIterations,
    InsufficientImprovement,
}

/// Full refinement history of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementRecord {
    pub node_id: NodeId,
    pub policy: RefinementPolicy,
    pub iterations: Vec<RefinementIteration>,
    pub stop_reason: StopReason,
    /// Iteration whose draft is the node's final output.
    pub accepted_iteration: u32,
    pub accepted_score: u8,
}

impl RefinementRecord {
    pub fn scores(&self) -> Vec<u8> {
        self.iterations.iter().map(|i| i.score).collect()
    }
}

/// Result of a completed loop.
#[derive(Debug, Clone)]
pub struct RefinementOutcome {
    pub record: RefinementRecord,
    /// Fields appended by redrafts and by a keep-best re-commit.
    pub written: Vec<FieldRef>,
}

/// Drives the loop for one node.
#[derive(Debug)]
pub struct RefinementController<'a> {
    invoker: &'a GenerationInvoker,
    assessor: &'a dyn QualityAssessor,
    settings: RefinementSection,
}

impl<'a> RefinementController<'a> {
    pub fn new(
        invoker: &'a GenerationInvoker,
        assessor: &'a dyn QualityAssessor,
        settings: RefinementSection,
    ) -> Self {
        Self {
            invoker,
            assessor,
            settings,
        }
    }

    /// Which stop condition, if any, holds after assessing `iteration`.
    pub fn stop_reason(
        settings: &RefinementSection,
        iteration: u32,
        score: u8,
        delta: Option<i32>,
    ) -> Option<StopReason> {
        if score >= settings.target_score {
            Some(StopReason::TargetReached)
        } else if iteration + 1 >= settings.max_iterations.max(1) {
            Some(StopReason::MaxIterations)
        } else if delta.is_some_and(|d| d <= settings.min_improvement) {
            Some(StopReason::InsufficientImprovement)
        } else {
            None
        }
    }

    /// Run the loop starting from the already-committed first draft.
    pub async fn run(
        &self,
        node: &ScheduledNode,
        context: &InputContext,
        first_draft: GenerationOutput,
        cancel: &CancelFlag,
    ) -> Result<RefinementOutcome, NodeError> {
        let mut drafts: Vec<GenerationOutput> = vec![first_draft];
        let mut iterations: Vec<RefinementIteration> = Vec::new();
        let mut written: Vec<FieldRef> = Vec::new();
        let mut iteration: u32 = 0;

        let stop_reason = loop {
            cancel.check()?;

            let current = &drafts[drafts.len() - 1];
            let assessment = with_retry(
                self.invoker.retry_policy(),
                cancel,
                &node.id,
                |_| self.assessor.assess(&current.draft_content, context),
            )
            .await?;

            let delta = iterations
                .last()
                .map(|prev| i32::from(assessment.score) - i32::from(prev.score));
            let stop = Self::stop_reason(&self.settings, iteration, assessment.score, delta);

            info!(
                node = %node.id,
                iteration,
                score = assessment.score,
                delta = ?delta,
                risk = ?assessment.hallucination_risk,
                issues = assessment.issues.len(),
                stop = ?stop,
                "refinement assessment"
            );

            iterations.push(RefinementIteration {
                iteration,
                score: assessment.score,
                delta,
                hallucination_risk: assessment.hallucination_risk,
                issues: assessment.issues.clone(),
                redrafted: stop.is_none(),
                timestamp: Utc::now(),
            });

            if let Some(reason) = stop {
                break reason;
            }

            cancel.check()?;
            let redraft_context =
                context.for_redraft(iteration + 1, &current.draft_content, &assessment.issues);
            let outcome = self
                .invoker
                .draft(node, &redraft_context, Some(iteration + 1), cancel)
                .await?;
            written.extend(outcome.written);
            drafts.push(outcome.output);
            iteration += 1;
        };

        let last = iterations.len() - 1;
        let accepted = match self.settings.policy {
            RefinementPolicy::KeepLast => last,
            RefinementPolicy::KeepBest => best_iteration(&iterations),
        };

        if accepted != last {
            debug!(
                node = %node.id,
                accepted,
                last,
                "keep_best: re-committing higher-scoring draft"
            );
            let recommitted = self.invoker.commit_replacing(
                node,
                Some(accepted as u32),
                &drafts[accepted],
                &written,
            );
            written.extend(recommitted);
        }

        Ok(RefinementOutcome {
            record: RefinementRecord {
                node_id: node.id.clone(),
                policy: self.settings.policy,
                accepted_iteration: accepted as u32,
                accepted_score: iterations[accepted].score,
                iterations,
                stop_reason,
            },
            written,
        })
    }
}

/// Index of the highest score; the earliest wins a tie.
fn best_iteration(iterations: &[RefinementIteration]) -> usize {
    let mut best = 0;
    for (i, it) in iterations.iter().enumerate() {
        if it.score > iterations[best].score {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(target: u8, max: u32, min_improvement: i32) -> RefinementSection {
        RefinementSection {
            target_score: target,
            max_iterations: max,
            min_improvement,
            policy: RefinementPolicy::KeepLast,
        }
    }

    #[test]
    fn stop_conditions_apply_in_order() {
        let s = settings(85, 3, 1);
        assert_eq!(
            RefinementController::stop_reason(&s, 0, 90, None),
            Some(StopReason::TargetReached)
        );
        assert_eq!(RefinementController::stop_reason(&s, 0, 42, None), None);
        assert_eq!(RefinementController::stop_reason(&s, 1, 66, Some(24)), None);
        assert_eq!(
            RefinementController::stop_reason(&s, 2, 67, Some(1)),
            Some(StopReason::MaxIterations)
        );
        assert_eq!(
            RefinementController::stop_reason(&settings(85, 5, 1), 2, 67, Some(1)),
            Some(StopReason::InsufficientImprovement)
        );
    }
}
