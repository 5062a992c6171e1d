// tests/runtime_fake_executor.rs

use std::error::Error;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::{mpsc, watch};

use docdag::config::PipelineFile;
use docdag::crossref::{Rule, RuleKind, Validator};
use docdag::dag::{NodeState, Scheduler};
use docdag::engine::{CoreCommand, CoreRuntime, Runtime, RuntimeEvent, RuntimeOptions};
use docdag::fs::FileSystem;
use docdag::fs::mock::MockFileSystem;
use docdag::report::RunStatus;
use docdag::store::{ArtifactStore, CheckpointStore, FieldRef, MemoryArtifactStore};
use docdag::types::Severity;
use docdag_test_utils::{
    FakeExecutor, NodeBuilder, PipelineBuilder, fields, init_tracing, with_timeout,
};

type TestResult = Result<(), Box<dyn Error>>;

fn field(s: &str) -> FieldRef {
    s.parse().unwrap()
}

fn core_for(pipeline: &PipelineFile, options: RuntimeOptions) -> CoreRuntime {
    let scheduler = Scheduler::from_pipeline(pipeline, "run-1".to_string()).unwrap();
    let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    CoreRuntime::new(scheduler, store, Validator::new(pipeline.rule.clone()), options)
}

/// Cost and Strategy must agree on the total; Plan needs both.
fn cost_pipeline(halt_on_error: bool) -> PipelineFile {
    PipelineBuilder::new()
        .node("Cost", NodeBuilder::new().outputs(&["total"]).build())
        .node("Strategy", NodeBuilder::new().outputs(&["total"]).build())
        .node(
            "Plan",
            NodeBuilder::new().after("Cost").after("Strategy").build(),
        )
        .rule(Rule::new(
            "totals-agree",
            Severity::Error,
            RuleKind::ExactMatch {
                left: field("Cost.total"),
                right: field("Strategy.total"),
            },
        ))
        .halt_on_error(halt_on_error)
        .build()
}

#[tokio::test]
async fn runtime_runs_chain_in_dependency_order() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new()
        .node("A", NodeBuilder::new().build())
        .node("B", NodeBuilder::new().after("A").build())
        .node("C", NodeBuilder::new().after("B").build())
        .build();
    let core = core_for(&pipeline, RuntimeOptions::default());
    let store = Arc::clone(core.store());

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), Arc::clone(&store), Arc::clone(&executed));
    let (report_tx, report_rx) = watch::channel(core.report());

    let report = with_timeout(
        Runtime::new(core, rx, tx, executor)
            .with_reports(report_tx)
            .run(),
    )
    .await?;

    assert_eq!(*executed.lock().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.is_clean());
    assert_eq!(store.read("C", "content"), Some(json!("C draft")));

    // The last published report matches the returned one.
    assert_eq!(report_rx.borrow().status, RunStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn error_finding_halts_run_when_configured() -> TestResult {
    init_tracing();

    let pipeline = cost_pipeline(true);
    let core = core_for(
        &pipeline,
        RuntimeOptions {
            halt_on_error: true,
            exit_when_quiescent: false,
        },
    );
    let store = Arc::clone(core.store());

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed))
        .with_fields("Cost", &[("total", json!(100))])
        .with_fields("Strategy", &[("total", json!(90))]);
    let cancelled = executor.cancelled_flag();

    let report = with_timeout(Runtime::new(core, rx, tx, executor).run()).await?;

    assert_eq!(report.status, RunStatus::Halted);
    assert!(*cancelled.lock().unwrap(), "halting cancels in-flight nodes");
    assert!(!executed.lock().unwrap().contains(&"Plan".to_string()));
    assert_eq!(report.state_of("Plan"), Some(NodeState::Blocked));
    let errors: Vec<_> = report.error_findings().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].documents, vec!["Cost", "Strategy"]);
    Ok(())
}

#[tokio::test]
async fn error_finding_is_reported_without_halting_by_default() -> TestResult {
    init_tracing();

    let pipeline = cost_pipeline(false);
    let core = core_for(&pipeline, RuntimeOptions::default());
    let store = Arc::clone(core.store());

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed))
        .with_fields("Cost", &[("total", json!(100))])
        .with_fields("Strategy", &[("total", json!(90))]);

    let report = with_timeout(Runtime::new(core, rx, tx, executor).run()).await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.state_of("Plan"), Some(NodeState::Completed));
    assert_eq!(report.error_findings().count(), 1);
    assert!(!report.is_clean());
    Ok(())
}

#[tokio::test]
async fn failed_node_blocks_downstream() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new()
        .node("A", NodeBuilder::new().build())
        .node("B", NodeBuilder::new().after("A").build())
        .node("Side", NodeBuilder::new().build())
        .build();
    let core = core_for(&pipeline, RuntimeOptions::default());
    let store = Arc::clone(core.store());

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed)).failing(
        "A",
        docdag::errors::NodeError::Generation(docdag::errors::GenerationError::permanent(
            "refused",
        )),
    );

    let report = with_timeout(Runtime::new(core, rx, tx, executor).run()).await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.state_of("A"), Some(NodeState::Failed));
    assert_eq!(report.state_of("B"), Some(NodeState::Blocked));
    assert_eq!(report.state_of("Side"), Some(NodeState::Completed));
    assert!(!executed.lock().unwrap().contains(&"B".to_string()));
    Ok(())
}

#[tokio::test]
async fn failed_checkpoint_write_does_not_end_the_run() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new()
        .node("A", NodeBuilder::new().build())
        .node("B", NodeBuilder::new().after("A").build())
        .build();
    let fs = MockFileSystem::new();
    // A directory where the checkpoint file should go makes every save fail.
    fs.add_file("state/run-1.json/occupied", "");
    let shared: Arc<dyn FileSystem> = Arc::new(fs.clone());
    let checkpoints = CheckpointStore::new(shared, "state");

    let core = core_for(&pipeline, RuntimeOptions::default());
    let store = Arc::clone(core.store());
    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed));

    let report = with_timeout(
        Runtime::new(core, rx, tx, executor)
            .with_checkpoints(checkpoints)
            .run(),
    )
    .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(*executed.lock().unwrap(), vec!["A", "B"]);
    assert!(report.checkpoint_error.is_some());
    assert!(report.render().contains("checkpoint not saved"));
    Ok(())
}

#[tokio::test]
async fn suspended_run_resumes_from_checkpoint() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new()
        .node("Draft", NodeBuilder::new().build())
        .node("Approval", NodeBuilder::new().after("Draft").human().build())
        .node("Publish", NodeBuilder::new().after("Approval").build())
        .build();
    let options = RuntimeOptions {
        halt_on_error: false,
        exit_when_quiescent: true,
    };
    let fs = MockFileSystem::new();
    let shared: Arc<dyn FileSystem> = Arc::new(fs.clone());
    let checkpoints = CheckpointStore::new(shared, "state");

    // First process: runs until the gate and suspends.
    let core = core_for(&pipeline, options);
    let store = Arc::clone(core.store());
    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed));

    let report = with_timeout(
        Runtime::new(core, rx, tx, executor)
            .with_checkpoints(checkpoints.clone())
            .run(),
    )
    .await?;

    assert_eq!(report.status, RunStatus::AwaitingHuman);
    assert_eq!(report.nodes_in(NodeState::AwaitingHuman), vec!["Approval"]);
    assert_eq!(report.state_of("Publish"), Some(NodeState::Pending));
    assert_eq!(*executed.lock().unwrap(), vec!["Draft"]);
    assert!(checkpoints.exists("run-1"));
    assert_eq!(checkpoints.list()?, vec!["run-1"]);

    // Second process: restore, apply the human payload, finish.
    let checkpoint = checkpoints.load("run-1")?;
    let mut core = CoreRuntime::from_checkpoint(&pipeline, &checkpoint, options)?;
    core.accept_resume("Approval", fields(&[("decision", json!("approved"))]))?;
    let store = Arc::clone(core.store());
    assert_eq!(store.read("Draft", "content"), Some(json!("Draft draft")));

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), Arc::clone(&store), Arc::clone(&executed));

    let report = with_timeout(
        Runtime::new(core, rx, tx, executor)
            .with_checkpoints(checkpoints.clone())
            .run(),
    )
    .await?;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(*executed.lock().unwrap(), vec!["Publish"]);
    assert_eq!(store.read("Approval", "decision"), Some(json!("approved")));
    assert_eq!(report.node("Approval").unwrap().attempts, 1);
    Ok(())
}

#[tokio::test]
async fn gate_timeout_fails_the_branch() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new()
        .node("Approval", NodeBuilder::new().gate_timeout("50ms").build())
        .node("Publish", NodeBuilder::new().after("Approval").build())
        .build();
    let core = core_for(&pipeline, RuntimeOptions::default());
    let store = Arc::clone(core.store());

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed));

    let report = with_timeout(Runtime::new(core, rx, tx, executor).run()).await?;

    assert_eq!(report.state_of("Approval"), Some(NodeState::Failed));
    assert!(
        report
            .node("Approval")
            .unwrap()
            .reason
            .as_deref()
            .unwrap()
            .contains("timed out")
    );
    assert_eq!(report.state_of("Publish"), Some(NodeState::Blocked));
    assert!(executed.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancel_stops_scheduling_and_raises_flags() -> TestResult {
    init_tracing();

    let pipeline = PipelineBuilder::new()
        .node("A", NodeBuilder::new().build())
        .node("B", NodeBuilder::new().after("A").build())
        .build();
    let core = core_for(&pipeline, RuntimeOptions::default());
    let store = Arc::clone(core.store());

    let (tx, rx) = mpsc::channel(64);
    let executed = Arc::new(Mutex::new(Vec::new()));
    let executor = FakeExecutor::new(tx.clone(), store, Arc::clone(&executed));
    let cancelled = executor.cancelled_flag();

    // Queued ahead of A's completion.
    tx.send(RuntimeEvent::CancelRequested).await?;

    let report = with_timeout(Runtime::new(core, rx, tx, executor).run()).await?;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(*cancelled.lock().unwrap());
    assert_eq!(*executed.lock().unwrap(), vec!["A"]);
    assert_eq!(report.state_of("B"), Some(NodeState::Blocked));
    assert_eq!(report.node("B").unwrap().reason.as_deref(), Some("cancelled"));
    Ok(())
}

#[test]
fn amendment_revalidates_without_changing_node_states() {
    init_tracing();

    let pipeline = cost_pipeline(false);
    let mut core = core_for(&pipeline, RuntimeOptions::default());

    let step = core.start();
    assert_eq!(step.dispatched(), vec!["Cost", "Strategy"]);

    core.store().commit(
        "Cost",
        fields(&[("total", json!(100))]),
        docdag::store::Provenance::new("Cost", 1),
    );
    core.store().commit(
        "Strategy",
        fields(&[("total", json!(90))]),
        docdag::store::Provenance::new("Strategy", 1),
    );
    core.step(RuntimeEvent::NodeCompleted {
        node: "Cost".into(),
        attempt: 1,
        written: vec![field("Cost.total")],
        refinement: None,
    });
    assert!(core.findings().has_errors());

    let step = core.step(RuntimeEvent::FieldsAmended {
        document: "Strategy".into(),
        fields: fields(&[("total", json!(100))]),
        reply: None,
    });
    assert!(!core.findings().has_errors());
    assert!(
        step.commands
            .iter()
            .any(|c| matches!(c, CoreCommand::Checkpoint))
    );
    assert_eq!(core.node_state("Strategy"), Some(NodeState::Running));

    let history = core.store().history("Strategy", "total");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].provenance.node_id, "external");
}

#[test]
fn resume_on_a_node_not_awaiting_is_rejected() {
    let pipeline = PipelineBuilder::new()
        .node("A", NodeBuilder::new().build())
        .node("Gate", NodeBuilder::new().after("A").human().build())
        .build();
    let mut core = core_for(&pipeline, RuntimeOptions::default());
    core.start();

    let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
    let step = core.step(RuntimeEvent::HumanResumed {
        node: "Gate".into(),
        payload: fields(&[("decision", json!("yes"))]),
        reply: Some(reply_tx),
    });

    assert!(step.keep_running);
    assert!(step.commands.is_empty());
    assert!(matches!(
        reply_rx.try_recv(),
        Ok(Err(docdag::errors::DocdagError::NotAwaitingHuman { .. }))
    ));
    assert_eq!(core.node_state("Gate"), Some(NodeState::Pending));
    assert!(core.store().read("Gate", "decision").is_none());
}
