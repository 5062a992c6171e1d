// tests/refinement_loop.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use docdag::config::model::{DataSource, RefinementSection};
use docdag::dag::ScheduledNode;
use docdag::engine::RuntimeEvent;
use docdag::errors::{GenerationError, NodeError};
use docdag::exec::{CancelFlag, NodeRunner, RetryPolicy};
use docdag::generation::{GenerationInvoker, GenerationOutput, QualityAssessor, StopReason};
use docdag::store::{ArtifactStore, MemoryArtifactStore, Provenance};
use docdag::types::RefinementPolicy;
use docdag_test_utils::{ScriptedAssessor, ScriptedCollaborator, fields, init_tracing, with_timeout};

fn scheduled(id: &str, refine: bool) -> ScheduledNode {
    ScheduledNode {
        id: id.to_string(),
        run_id: "run".to_string(),
        attempt: 1,
        tier: 0,
        refine,
        output_fields: Vec::new(),
        data_sources: BTreeMap::new(),
    }
}

fn settings(target_score: u8, max_iterations: u32, policy: RefinementPolicy) -> RefinementSection {
    RefinementSection {
        target_score,
        max_iterations,
        min_improvement: 1,
        policy,
    }
}

struct Harness {
    store: Arc<dyn ArtifactStore>,
    collaborator: ScriptedCollaborator,
    assessor: ScriptedAssessor,
    runner: NodeRunner,
}

fn harness(
    collaborator: ScriptedCollaborator,
    scores: Vec<u8>,
    refinement: RefinementSection,
) -> Harness {
    let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let assessor = ScriptedAssessor::new(scores);
    let invoker = GenerationInvoker::new(
        Arc::new(collaborator.clone()),
        Arc::clone(&store),
        RetryPolicy::immediate(3),
    );
    let shared: Arc<dyn QualityAssessor> = Arc::new(assessor.clone());
    let runner = NodeRunner::new(invoker, Some(shared), refinement);
    Harness {
        store,
        collaborator,
        assessor,
        runner,
    }
}

#[tokio::test]
async fn stalled_scores_stop_on_insufficient_improvement() {
    init_tracing();
    let h = harness(
        ScriptedCollaborator::new(),
        vec![42, 66, 67],
        settings(85, 5, RefinementPolicy::KeepLast),
    );

    let event = with_timeout(h.runner.execute(scheduled("Plan", true), CancelFlag::new())).await;

    let RuntimeEvent::NodeCompleted { refinement, .. } = event else {
        panic!("expected NodeCompleted, got {event:?}");
    };
    let record = refinement.expect("refinement record");
    assert_eq!(record.scores(), vec![42, 66, 67]);
    assert_eq!(record.stop_reason, StopReason::InsufficientImprovement);
    assert_eq!(record.accepted_iteration, 2);
    assert_eq!(record.accepted_score, 67);
    assert_eq!(record.iterations[1].delta, Some(24));
    assert!(record.iterations[1].redrafted);
    assert!(!record.iterations[2].redrafted);

    assert_eq!(h.assessor.assessments(), 3);
    assert_eq!(h.collaborator.call_count("Plan"), 3);

    let content = h.store.history("Plan", "content");
    assert_eq!(content.len(), 3);
    assert_eq!(content[2].value, json!("Plan draft 3"));
    assert_eq!(content[2].provenance.iteration, Some(2));
    assert_eq!(content[0].provenance.iteration, None);
}

#[tokio::test]
async fn redraft_sees_prior_draft_and_issues() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![50, 90],
        settings(85, 3, RefinementPolicy::KeepLast),
    );

    with_timeout(h.runner.execute(scheduled("Plan", true), CancelFlag::new())).await;

    let calls = h.collaborator.calls_for("Plan");
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].iteration, None);
    assert_eq!(calls[1].iteration, Some(1));
    assert_eq!(calls[1].prior_draft.as_deref(), Some("Plan draft 1"));
    assert_eq!(calls[1].issues.len(), 1);
    assert_eq!(calls[1].issues[0].category, "clarity");

    let assessed = h.assessor.assessed();
    assert_eq!(assessed[1], ("Plan".to_string(), "Plan draft 2".to_string()));
}

#[tokio::test]
async fn keep_best_recommits_the_highest_scoring_draft() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![70, 60],
        settings(85, 2, RefinementPolicy::KeepBest),
    );

    let event = with_timeout(h.runner.execute(scheduled("Plan", true), CancelFlag::new())).await;

    let RuntimeEvent::NodeCompleted { refinement, .. } = event else {
        panic!("expected NodeCompleted, got {event:?}");
    };
    let record = refinement.expect("refinement record");
    assert_eq!(record.stop_reason, StopReason::MaxIterations);
    assert_eq!(record.accepted_iteration, 0);
    assert_eq!(record.accepted_score, 70);

    // Nothing is overwritten: the best draft is appended again.
    let content = h.store.history("Plan", "content");
    assert_eq!(content.len(), 3);
    assert_eq!(content[0].value, json!("Plan draft 1"));
    assert_eq!(content[1].value, json!("Plan draft 2"));
    assert_eq!(content[2].value, json!("Plan draft 1"));
    assert_eq!(h.store.read("Plan", "content"), Some(json!("Plan draft 1")));
}

#[tokio::test]
async fn keep_best_retracts_fields_only_a_rejected_draft_extracted() {
    let collaborator = ScriptedCollaborator::new()
        .push_result("Plan", Ok(GenerationOutput::new("draft 1").with_field("total", 100)))
        .push_result(
            "Plan",
            Ok(GenerationOutput::new("draft 2")
                .with_field("total", 250)
                .with_field("risk_note", "new")),
        );
    let h = harness(collaborator, vec![70, 60], settings(85, 2, RefinementPolicy::KeepBest));

    let event = with_timeout(h.runner.execute(scheduled("Plan", true), CancelFlag::new())).await;
    assert!(matches!(event, RuntimeEvent::NodeCompleted { .. }), "{event:?}");

    let snapshot = h.store.snapshot();
    let plan = snapshot.document("Plan").unwrap();
    assert_eq!(plan["content"], json!("draft 1"));
    assert_eq!(plan["total"], json!(100));
    assert!(!plan.contains_key("risk_note"), "{plan:?}");
    assert_eq!(h.store.read("Plan", "risk_note"), None);

    // The rejected value stays in the lineage.
    let risk = h.store.history("Plan", "risk_note");
    assert_eq!(risk.len(), 2);
    assert_eq!(risk[0].value, json!("new"));
    assert!(risk[1].value.is_null());
    assert_eq!(risk[1].provenance.iteration, Some(0));
}

#[tokio::test]
async fn keep_last_accepts_a_regression() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![70, 60],
        settings(85, 2, RefinementPolicy::KeepLast),
    );

    with_timeout(h.runner.execute(scheduled("Plan", true), CancelFlag::new())).await;

    assert_eq!(h.store.history("Plan", "content").len(), 2);
    assert_eq!(h.store.read("Plan", "content"), Some(json!("Plan draft 2")));
}

#[tokio::test]
async fn target_reached_on_first_draft_skips_redrafts() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![92],
        settings(85, 3, RefinementPolicy::KeepLast),
    );

    let event = with_timeout(h.runner.execute(scheduled("Plan", true), CancelFlag::new())).await;

    let RuntimeEvent::NodeCompleted { refinement, .. } = event else {
        panic!("expected NodeCompleted, got {event:?}");
    };
    assert_eq!(refinement.unwrap().stop_reason, StopReason::TargetReached);
    assert_eq!(h.collaborator.call_count("Plan"), 1);
}

#[tokio::test]
async fn nodes_without_refine_are_never_assessed() {
    let h = harness(
        ScriptedCollaborator::new().with_fields("Cost", &[("total", json!(1_250_000))]),
        vec![10],
        settings(85, 3, RefinementPolicy::KeepLast),
    );

    let event = with_timeout(h.runner.execute(scheduled("Cost", false), CancelFlag::new())).await;

    let RuntimeEvent::NodeCompleted {
        written,
        refinement,
        ..
    } = event
    else {
        panic!("expected NodeCompleted, got {event:?}");
    };
    assert!(refinement.is_none());
    assert_eq!(h.assessor.assessments(), 0);
    assert!(written.iter().any(|f| f.to_string() == "Cost.total"));
    assert_eq!(h.store.read("Cost", "total"), Some(json!(1_250_000)));
}

#[tokio::test]
async fn missing_required_input_fails_without_calling_collaborator() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![],
        settings(85, 3, RefinementPolicy::KeepLast),
    );
    let mut node = scheduled("Strategy", false);
    node.data_sources.insert(
        "cost".to_string(),
        DataSource {
            node: "Cost".to_string(),
            fields: vec!["total".to_string()],
            required: true,
        },
    );

    let event = with_timeout(h.runner.execute(node, CancelFlag::new())).await;

    match event {
        RuntimeEvent::NodeFailed {
            error: NodeError::MissingInput {
                source_node, field, ..
            },
            ..
        } => {
            assert_eq!(source_node, "Cost");
            assert_eq!(field, "total");
        }
        other => panic!("expected MissingInput, got {other:?}"),
    }
    assert!(h.collaborator.calls().is_empty());
}

#[tokio::test]
async fn projected_inputs_reach_the_collaborator() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![],
        settings(85, 3, RefinementPolicy::KeepLast),
    );
    h.store.commit(
        "Cost",
        fields(&[("total", json!(100)), ("labor", json!(60))]),
        Provenance::new("Cost", 1),
    );
    let mut node = scheduled("Strategy", false);
    node.data_sources.insert(
        "cost".to_string(),
        DataSource {
            node: "Cost".to_string(),
            fields: vec!["total".to_string()],
            required: true,
        },
    );
    node.data_sources.insert(
        "research".to_string(),
        DataSource {
            node: "MarketResearch".to_string(),
            fields: Vec::new(),
            required: false,
        },
    );

    with_timeout(h.runner.execute(node, CancelFlag::new())).await;

    let calls = h.collaborator.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].inputs["cost"], json!({ "total": 100 }));
    assert!(!calls[0].inputs.contains_key("research"));
}

#[tokio::test]
async fn retryable_collaborator_errors_are_retried() {
    let collaborator = ScriptedCollaborator::new()
        .push_result("Cost", Err(GenerationError::retryable("rate limited")))
        .push_result("Cost", Ok(GenerationOutput::new("second try")));
    let h = harness(collaborator, vec![], settings(85, 3, RefinementPolicy::KeepLast));

    let event = with_timeout(h.runner.execute(scheduled("Cost", false), CancelFlag::new())).await;

    assert!(matches!(event, RuntimeEvent::NodeCompleted { .. }));
    assert_eq!(h.collaborator.call_count("Cost"), 2);
    assert_eq!(h.store.read("Cost", "content"), Some(json!("second try")));
}

#[tokio::test]
async fn permanent_collaborator_errors_fail_immediately() {
    let collaborator = ScriptedCollaborator::new()
        .push_result("Cost", Err(GenerationError::permanent("content policy")));
    let h = harness(collaborator, vec![], settings(85, 3, RefinementPolicy::KeepLast));

    let event = with_timeout(h.runner.execute(scheduled("Cost", false), CancelFlag::new())).await;

    match event {
        RuntimeEvent::NodeFailed {
            error: NodeError::Generation(e),
            ..
        } => assert!(!e.is_retryable()),
        other => panic!("expected a generation failure, got {other:?}"),
    }
    assert_eq!(h.collaborator.call_count("Cost"), 1);
    assert!(h.store.read("Cost", "content").is_none());
}

#[tokio::test]
async fn cancelled_node_reports_cancellation() {
    let h = harness(
        ScriptedCollaborator::new(),
        vec![],
        settings(85, 3, RefinementPolicy::KeepLast),
    );
    let cancel = CancelFlag::new();
    cancel.cancel();

    let event = with_timeout(h.runner.execute(scheduled("Cost", false), cancel)).await;

    assert!(matches!(
        event,
        RuntimeEvent::NodeFailed {
            error: NodeError::Cancelled,
            ..
        }
    ));
    assert!(h.collaborator.calls().is_empty());
}
