// tests/controller_end_to_end.rs

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use docdag::condition::Predicate;
use docdag::config::{InitialInputs, PipelineFile};
use docdag::control::PipelineController;
use docdag::crossref::{Rule, RuleKind};
use docdag::dag::NodeState;
use docdag::errors::DocdagError;
use docdag::fs::{FileSystem, RealFileSystem};
use docdag::report::{RunReport, RunStatus};
use docdag::store::{CheckpointStore, FieldRef};
use docdag::types::{RefinementPolicy, Severity};
use docdag_test_utils::{
    NodeBuilder, PipelineBuilder, ScriptedAssessor, ScriptedCollaborator, fields, init_tracing,
    with_timeout,
};

fn field(s: &str) -> FieldRef {
    s.parse().unwrap()
}

fn program_inputs() -> InitialInputs {
    InitialInputs::from([(
        "Program".to_string(),
        fields(&[
            ("name", json!("Radar Upgrade")),
            ("budget", json!(1_250_000)),
        ]),
    )])
}

/// Requirements -> Cost -> Strategy -> (Justification, only for sole
/// source) -> Plan.
fn acquisition_pipeline() -> PipelineFile {
    PipelineBuilder::new()
        .input("Program")
        .node(
            "Requirements",
            NodeBuilder::new()
                .source("program", "Program", &["name", "budget"])
                .outputs(&["summary"])
                .build(),
        )
        .node(
            "CostEstimate",
            NodeBuilder::new()
                .after("Requirements")
                .source("requirements", "Requirements", &[])
                .outputs(&["total_cost"])
                .build(),
        )
        .node(
            "Strategy",
            NodeBuilder::new()
                .after("CostEstimate")
                .source("cost", "CostEstimate", &["total_cost"])
                .outputs(&["competition_strategy", "total_estimated_cost"])
                .build(),
        )
        .node(
            "Justification",
            NodeBuilder::new()
                .when(
                    "Strategy",
                    Predicate::not_equals(field("Strategy.competition_strategy"), "Full and Open"),
                )
                .build(),
        )
        .node(
            "Plan",
            NodeBuilder::new()
                .after("Strategy")
                .after("Justification")
                .optional_source("justification", "Justification", &[])
                .build(),
        )
        .rule(Rule::new(
            "cost-matches",
            Severity::Error,
            RuleKind::ExactMatch {
                left: field("CostEstimate.total_cost"),
                right: field("Strategy.total_estimated_cost"),
            },
        ))
        .rule(Rule::new(
            "justification-present",
            Severity::Error,
            RuleKind::ConditionalExistence {
                when: Predicate::equals(field("Strategy.competition_strategy"), "Sole Source"),
                node: "Justification".to_string(),
                field: None,
            },
        ))
        .build()
}

fn acquisition_collaborator(strategy: &str, strategy_total: i64) -> ScriptedCollaborator {
    ScriptedCollaborator::new()
        .with_fields("CostEstimate", &[("total_cost", json!(1_250_000))])
        .with_fields(
            "Strategy",
            &[
                ("competition_strategy", json!(strategy)),
                ("total_estimated_cost", json!(strategy_total)),
            ],
        )
}

async fn run_to_end(
    controller: &PipelineController,
    pipeline: &PipelineFile,
    inputs: InitialInputs,
) -> RunReport {
    let run_id = controller.start(pipeline, inputs).unwrap();
    with_timeout(controller.wait(&run_id)).await.unwrap()
}

#[tokio::test]
async fn full_and_open_skips_justification() {
    init_tracing();
    let collaborator = acquisition_collaborator("Full and Open", 1_250_000);
    let controller = PipelineController::new(Arc::new(collaborator.clone()));

    let report = run_to_end(&controller, &acquisition_pipeline(), program_inputs()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.is_clean(), "{}", report.render());
    assert_eq!(report.state_of("Justification"), Some(NodeState::Skipped));
    assert_eq!(report.node("Justification").unwrap().condition_result, Some(false));
    assert_eq!(report.state_of("Plan"), Some(NodeState::Completed));
    assert_eq!(collaborator.call_count("Justification"), 0);

    // Inputs are projected from upstream documents.
    let requirements = &collaborator.calls_for("Requirements")[0];
    assert_eq!(
        requirements.inputs["program"],
        json!({ "name": "Radar Upgrade", "budget": 1_250_000 })
    );
    let strategy = &collaborator.calls_for("Strategy")[0];
    assert_eq!(strategy.inputs["cost"], json!({ "total_cost": 1_250_000 }));
    assert!(!collaborator.calls_for("Plan")[0].inputs.contains_key("justification"));
}

#[tokio::test]
async fn sole_source_runs_justification() {
    init_tracing();
    let collaborator = acquisition_collaborator("Sole Source", 1_250_000);
    let controller = PipelineController::new(Arc::new(collaborator.clone()));

    let report = run_to_end(&controller, &acquisition_pipeline(), program_inputs()).await;

    assert!(report.is_clean(), "{}", report.render());
    assert_eq!(report.state_of("Justification"), Some(NodeState::Completed));
    assert_eq!(collaborator.call_count("Justification"), 1);
    assert!(
        collaborator.calls_for("Plan")[0]
            .inputs
            .contains_key("justification")
    );
}

#[tokio::test]
async fn cost_regression_is_reported_against_both_documents() {
    init_tracing();
    let collaborator = acquisition_collaborator("Full and Open", 1_200_000);
    let controller = PipelineController::new(Arc::new(collaborator));

    let report = run_to_end(&controller, &acquisition_pipeline(), program_inputs()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(!report.is_clean());
    let errors: Vec<_> = report.error_findings().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].rule_id, "cost-matches");
    assert_eq!(errors[0].documents, vec!["CostEstimate", "Strategy"]);
}

#[tokio::test]
async fn missing_input_cascades_to_blocked() {
    init_tracing();
    let collaborator = acquisition_collaborator("Full and Open", 1_250_000);
    let controller = PipelineController::new(Arc::new(collaborator.clone()));
    let inputs = InitialInputs::from([(
        "Program".to_string(),
        fields(&[("name", json!("Radar Upgrade"))]),
    )]);

    let report = run_to_end(&controller, &acquisition_pipeline(), inputs).await;

    assert_eq!(report.state_of("Requirements"), Some(NodeState::Failed));
    let reason = report.node("Requirements").unwrap().reason.clone().unwrap();
    assert!(reason.contains("Program.budget"), "{reason}");
    for downstream in ["CostEstimate", "Strategy", "Justification", "Plan"] {
        assert_eq!(report.state_of(downstream), Some(NodeState::Blocked), "{downstream}");
    }
    assert!(collaborator.calls().is_empty());
}

#[tokio::test]
async fn refining_node_needs_an_assessor() {
    let pipeline = PipelineBuilder::new()
        .node("Plan", NodeBuilder::new().refine().build())
        .build();
    let controller = PipelineController::new(Arc::new(ScriptedCollaborator::new()));

    assert!(matches!(
        controller.start(&pipeline, InitialInputs::new()),
        Err(DocdagError::Config(_))
    ));
}

#[tokio::test]
async fn refinement_history_appears_in_the_report() {
    init_tracing();
    let pipeline = PipelineBuilder::new()
        .node("Plan", NodeBuilder::new().refine().build())
        .refinement(85, 3, 1, RefinementPolicy::KeepLast)
        .build();
    let assessor = ScriptedAssessor::new([60, 88]);
    let controller = PipelineController::new(Arc::new(ScriptedCollaborator::new()))
        .with_assessor(Arc::new(assessor.clone()));

    let report = run_to_end(&controller, &pipeline, InitialInputs::new()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.refinement["Plan"].scores(), vec![60, 88]);
    assert_eq!(assessor.assessments_by_node()["Plan"], 2);
}

/// Draft -> Approval (human) -> Signoff (human) -> Publish, with the
/// approved total required to match the draft.
fn approval_pipeline() -> PipelineFile {
    PipelineBuilder::new()
        .node("Draft", NodeBuilder::new().outputs(&["total"]).build())
        .node("Approval", NodeBuilder::new().after("Draft").human().build())
        .node("Signoff", NodeBuilder::new().after("Approval").human().build())
        .node(
            "Publish",
            NodeBuilder::new()
                .after("Signoff")
                .source("approval", "Approval", &["total"])
                .build(),
        )
        .rule(Rule::new(
            "approved-total",
            Severity::Error,
            RuleKind::ExactMatch {
                left: field("Draft.total"),
                right: field("Approval.total"),
            },
        ))
        .build()
}

#[tokio::test]
async fn resume_amend_and_finish_in_process() {
    init_tracing();
    let collaborator = ScriptedCollaborator::new().with_fields("Draft", &[("total", json!(10))]);
    let controller = PipelineController::new(Arc::new(collaborator.clone()));
    let pipeline = approval_pipeline();

    let run_id = controller.start(&pipeline, InitialInputs::new()).unwrap();
    let mut reports = controller.subscribe(&run_id).unwrap();

    with_timeout(reports.wait_for(|r| r.status == RunStatus::AwaitingHuman))
        .await
        .unwrap();
    assert_eq!(controller.runs(), vec![run_id.clone()]);

    // Only the awaiting node takes a payload.
    let err = controller
        .resume(&run_id, "Draft", fields(&[("total", json!(1))]))
        .await
        .unwrap_err();
    assert!(matches!(err, DocdagError::NotAwaitingHuman { .. }), "{err}");
    let err = controller
        .resume(&run_id, "Approval", fields(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, DocdagError::Config(_)), "{err}");

    controller
        .resume(&run_id, "Approval", fields(&[("total", json!(12))]))
        .await
        .unwrap();
    let report = with_timeout(reports.wait_for(|r| {
        r.state_of("Signoff") == Some(NodeState::AwaitingHuman)
    }))
    .await
    .unwrap()
    .clone();
    assert_eq!(report.error_findings().count(), 1);

    // An external correction clears the finding.
    controller
        .amend(&run_id, "Draft", "total", json!(12))
        .await
        .unwrap();
    with_timeout(reports.wait_for(|r| r.error_findings().next().is_none()))
        .await
        .unwrap();

    controller
        .resume(&run_id, "Signoff", fields(&[("signed_by", json!("cfo"))]))
        .await
        .unwrap();
    let report = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert!(report.is_clean(), "{}", report.render());
    assert_eq!(
        collaborator.calls_for("Publish")[0].inputs["approval"],
        json!({ "total": 12 })
    );
}

#[tokio::test]
async fn cancel_ends_the_run() {
    init_tracing();
    let controller = PipelineController::new(Arc::new(ScriptedCollaborator::new()));
    let pipeline = approval_pipeline();

    let run_id = controller.start(&pipeline, InitialInputs::new()).unwrap();
    let mut reports = controller.subscribe(&run_id).unwrap();
    with_timeout(reports.wait_for(|r| r.status == RunStatus::AwaitingHuman))
        .await
        .unwrap();

    controller.cancel(&run_id).await.unwrap();
    let report = with_timeout(controller.wait(&run_id)).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.state_of("Draft"), Some(NodeState::Completed));
    for node in ["Approval", "Signoff", "Publish"] {
        assert_eq!(report.state_of(node), Some(NodeState::Blocked), "{node}");
    }

    // A finished run no longer accepts a resume.
    let err = controller
        .resume(&run_id, "Approval", fields(&[("total", json!(10))]))
        .await
        .unwrap_err();
    assert!(matches!(err, DocdagError::NotAwaitingHuman { .. }), "{err}");
}

#[tokio::test]
async fn concurrent_waiters_both_receive_the_final_report() {
    init_tracing();
    let collaborator = acquisition_collaborator("Full and Open", 1_250_000);
    let controller = PipelineController::new(Arc::new(collaborator));
    let run_id = controller.start(&acquisition_pipeline(), program_inputs()).unwrap();

    // Only one waiter can own the run task; the other follows the reports.
    let (first, second) = with_timeout(async {
        tokio::join!(controller.wait(&run_id), controller.wait(&run_id))
    })
    .await;

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(first.nodes, second.nodes);
}

#[tokio::test]
async fn inputs_cannot_stand_in_for_node_output() {
    init_tracing();
    let collaborator = acquisition_collaborator("Sole Source", 1_250_000);
    let controller = PipelineController::new(Arc::new(collaborator.clone()));
    let mut inputs = program_inputs();
    inputs.insert(
        "Justification".to_string(),
        fields(&[("content", json!("pre-filled"))]),
    );

    let err = controller.start(&acquisition_pipeline(), inputs).unwrap_err();

    assert!(matches!(err, DocdagError::Config(_)), "{err}");
    assert!(err.to_string().contains("Justification"), "{err}");
    assert!(controller.runs().is_empty());
    assert!(collaborator.calls().is_empty());
}

#[tokio::test]
async fn unknown_run_is_reported() {
    let controller = PipelineController::new(Arc::new(ScriptedCollaborator::new()));
    assert!(matches!(
        controller.status("no-such-run"),
        Err(DocdagError::UnknownRun(_))
    ));
    assert!(matches!(
        controller.resume("no-such-run", "A", fields(&[("x", json!(1))])).await,
        Err(DocdagError::UnknownRun(_))
    ));
}

#[tokio::test]
async fn suspended_run_resumes_across_controllers() {
    init_tracing();
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let pipeline = PipelineBuilder::new()
        .node("Draft", NodeBuilder::new().outputs(&["total"]).build())
        .node("Approval", NodeBuilder::new().after("Draft").human().build())
        .node("Publish", NodeBuilder::new().after("Approval").build())
        .state_dir(&state_dir)
        .build();

    // First process: suspends at the gate and exits.
    let first = PipelineController::new(Arc::new(ScriptedCollaborator::new()))
        .with_exit_when_quiescent(true);
    let report = run_to_end(&first, &pipeline, InitialInputs::new()).await;
    assert_eq!(report.status, RunStatus::AwaitingHuman);
    let run_id = report.run_id.clone();

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let checkpoints = CheckpointStore::new(fs, &state_dir);
    assert_eq!(checkpoints.list().unwrap(), vec![run_id.clone()]);
    let checkpoint = checkpoints.load(&run_id).unwrap();

    // A payload for the wrong node is rejected before anything runs.
    let second = PipelineController::new(Arc::new(ScriptedCollaborator::new()))
        .with_exit_when_quiescent(true);
    assert!(matches!(
        second.restore_and_resume(&pipeline, &checkpoint, "Publish", fields(&[("x", json!(1))])),
        Err(DocdagError::NotAwaitingHuman { .. })
    ));

    // Second process: applies the payload and finishes the run.
    let collaborator = ScriptedCollaborator::new();
    let third = PipelineController::new(Arc::new(collaborator.clone()))
        .with_exit_when_quiescent(true);
    third
        .restore_and_resume(
            &pipeline,
            &checkpoint,
            "Approval",
            fields(&[("decision", json!("approved"))]),
        )
        .unwrap();
    let report = with_timeout(third.wait(&run_id)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.is_clean());
    assert_eq!(collaborator.call_count("Draft"), 0);
    assert_eq!(collaborator.call_count("Publish"), 1);

    let saved = checkpoints.load(&run_id).unwrap();
    assert_eq!(saved.nodes["Publish"].state, NodeState::Completed);
}
