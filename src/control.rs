// src/control.rs

//! Control surface for pipeline runs.
//!
//! [`PipelineController`] starts runs on the Tokio runtime and talks to each
//! one through its event channel. Every run publishes a fresh [`RunReport`]
//! on a `watch` channel after each scheduler step; `status` reads the latest
//! one and `wait` blocks until the run ends.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{InitialInputs, PipelineFile};
use crate::crossref::Validator;
use crate::dag::{NodeState, Scheduler};
use crate::engine::{CoreRuntime, NodeId, RunId, Runtime, RuntimeEvent, RuntimeOptions};
use crate::errors::{DocdagError, Result};
use crate::exec::{NodeRunner, RealExecutorBackend, RetryPolicy};
use crate::fs::{FileSystem, RealFileSystem};
use crate::generation::{GenerationCollaborator, GenerationInvoker, QualityAssessor};
use crate::report::RunReport;
use crate::store::{
    ArtifactStore, CheckpointStore, DocumentId, FieldName, INITIAL_INPUT_NODE,
    MemoryArtifactStore, Provenance, RunCheckpoint,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

struct RunHandle {
    events: mpsc::Sender<RuntimeEvent>,
    reports: watch::Receiver<RunReport>,
    join: Option<JoinHandle<Result<RunReport>>>,
}

/// Starts, observes and steers pipeline runs.
pub struct PipelineController {
    collaborator: Arc<dyn GenerationCollaborator>,
    assessor: Option<Arc<dyn QualityAssessor>>,
    fs: Arc<dyn FileSystem>,
    exit_when_quiescent: bool,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("collaborator", &self.collaborator)
            .field("assessor", &self.assessor)
            .field("exit_when_quiescent", &self.exit_when_quiescent)
            .field("runs", &self.runs().len())
            .finish()
    }
}

impl PipelineController {
    pub fn new(collaborator: Arc<dyn GenerationCollaborator>) -> Self {
        Self {
            collaborator,
            assessor: None,
            fs: Arc::new(RealFileSystem),
            exit_when_quiescent: false,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_assessor(mut self, assessor: Arc<dyn QualityAssessor>) -> Self {
        self.assessor = Some(assessor);
        self
    }

    /// Filesystem used for checkpoints when `state_dir` is set.
    pub fn with_filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Stop a run's runtime once it can only progress through a resume,
    /// instead of keeping it alive in memory. The run stays resumable from
    /// its checkpoint.
    pub fn with_exit_when_quiescent(mut self, exit: bool) -> Self {
        self.exit_when_quiescent = exit;
        self
    }

    /// Ids of every run started by this controller.
    pub fn runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start a new run: seed the store with `inputs` and begin scheduling.
    pub fn start(&self, pipeline: &PipelineFile, inputs: InitialInputs) -> Result<RunId> {
        self.check_assessor(pipeline)?;

        // An input under a node id would stand in for output the node never drafted.
        if let Some(document) = inputs.keys().find(|d| pipeline.node.contains_key(*d)) {
            return Err(DocdagError::Config(format!(
                "initial input '{document}' has the same id as a pipeline node"
            )));
        }

        let run_id = Uuid::new_v4().to_string();
        let scheduler = Scheduler::from_pipeline(pipeline, run_id.clone())?;

        for declared in &pipeline.config.inputs {
            if !inputs.contains_key(declared) {
                warn!(run_id = %run_id, document = %declared, "declared input document not supplied");
            }
        }

        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        for (document, fields) in inputs {
            debug!(run_id = %run_id, document = %document, fields = fields.len(), "seeding initial input");
            store.commit(&document, fields, Provenance::new(INITIAL_INPUT_NODE, 1));
        }

        let core = CoreRuntime::new(
            scheduler,
            store,
            Validator::new(pipeline.rule.clone()),
            self.options(pipeline),
        );
        info!(run_id = %run_id, nodes = pipeline.node.len(), rules = pipeline.rule.len(), "starting run");
        self.spawn(pipeline, core)?;
        Ok(run_id)
    }

    /// Continue a run from its checkpoint.
    pub fn restore(&self, pipeline: &PipelineFile, checkpoint: &RunCheckpoint) -> Result<RunId> {
        self.check_assessor(pipeline)?;
        let core = CoreRuntime::from_checkpoint(pipeline, checkpoint, self.options(pipeline))?;
        info!(run_id = %checkpoint.run_id, "restoring run from checkpoint");
        self.spawn(pipeline, core)?;
        Ok(checkpoint.run_id.clone())
    }

    /// Continue a run from its checkpoint with a human resume applied
    /// before anything is scheduled.
    pub fn restore_and_resume(
        &self,
        pipeline: &PipelineFile,
        checkpoint: &RunCheckpoint,
        node: &str,
        payload: BTreeMap<FieldName, Value>,
    ) -> Result<RunId> {
        self.check_assessor(pipeline)?;
        let mut core = CoreRuntime::from_checkpoint(pipeline, checkpoint, self.options(pipeline))?;
        core.accept_resume(node, payload)?;
        info!(run_id = %checkpoint.run_id, node = %node, "restoring run with human input");
        self.spawn(pipeline, core)?;
        Ok(checkpoint.run_id.clone())
    }

    /// Latest published report.
    pub fn status(&self, run_id: &str) -> Result<RunReport> {
        let runs = self.lock();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| DocdagError::UnknownRun(run_id.to_string()))?;
        Ok(handle.reports.borrow().clone())
    }

    /// Subscribe to report updates.
    pub fn subscribe(&self, run_id: &str) -> Result<watch::Receiver<RunReport>> {
        let runs = self.lock();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| DocdagError::UnknownRun(run_id.to_string()))?;
        Ok(handle.reports.clone())
    }

    /// Supply the human-authored payload for an AwaitingHuman node.
    ///
    /// Rejected with [`DocdagError::NotAwaitingHuman`] when the node is in
    /// any other state.
    pub async fn resume(
        &self,
        run_id: &str,
        node: &str,
        payload: BTreeMap<FieldName, Value>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let event = RuntimeEvent::HumanResumed {
            node: node.to_string(),
            payload,
            reply: Some(tx),
        };
        if self.send(run_id, event).await.is_err() {
            return Err(self.inactive_resume_error(run_id, node));
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.inactive_resume_error(run_id, node)),
        }
    }

    /// External write of one field; triggers incremental validation.
    pub async fn amend(
        &self,
        run_id: &str,
        document: &str,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let event = RuntimeEvent::FieldsAmended {
            document: DocumentId::from(document),
            fields: BTreeMap::from([(field.to_string(), value)]),
            reply: Some(tx),
        };
        let ended = || DocdagError::Config(format!("run '{run_id}' has ended; amendments are not accepted"));
        self.send(run_id, event).await.map_err(|_| ended())?;
        rx.await.map_err(|_| ended())?
    }

    /// Cooperatively cancel every running node and stop scheduling.
    pub async fn cancel(&self, run_id: &str) -> Result<()> {
        if self.send(run_id, RuntimeEvent::CancelRequested).await.is_err() {
            debug!(run_id = %run_id, "cancel requested for a run that already ended");
        }
        Ok(())
    }

    /// Stop the runtime without cancelling the run; it stays resumable from
    /// its checkpoint.
    pub async fn shutdown(&self, run_id: &str) -> Result<()> {
        if self.send(run_id, RuntimeEvent::ShutdownRequested).await.is_err() {
            debug!(run_id = %run_id, "shutdown requested for a run that already ended");
        }
        Ok(())
    }

    /// Wait for the run's runtime to stop and return its last report.
    pub async fn wait(&self, run_id: &str) -> Result<RunReport> {
        let (join, mut reports) = {
            let mut runs = self.lock();
            let handle = runs
                .get_mut(run_id)
                .ok_or_else(|| DocdagError::UnknownRun(run_id.to_string()))?;
            (handle.join.take(), handle.reports.clone())
        };

        if let Some(join) = join {
            return join
                .await
                .map_err(|e| DocdagError::Other(anyhow::anyhow!("run task for '{run_id}' failed: {e}")))?;
        }

        // Someone else already owns the join handle; follow the reports.
        let waited = reports
            .wait_for(RunReport::is_finished)
            .await
            .map(|report| report.clone());
        Ok(waited.unwrap_or_else(|_| reports.borrow().clone()))
    }

    fn options(&self, pipeline: &PipelineFile) -> RuntimeOptions {
        RuntimeOptions {
            halt_on_error: pipeline.config.halt_on_error,
            exit_when_quiescent: self.exit_when_quiescent,
        }
    }

    fn check_assessor(&self, pipeline: &PipelineFile) -> Result<()> {
        let refining: Vec<&String> = pipeline
            .node
            .iter()
            .filter(|(_, n)| n.refine)
            .map(|(id, _)| id)
            .collect();
        if !refining.is_empty() && self.assessor.is_none() {
            return Err(DocdagError::Config(format!(
                "nodes {refining:?} refine but no quality assessor is configured"
            )));
        }
        Ok(())
    }

    fn spawn(&self, pipeline: &PipelineFile, core: CoreRuntime) -> Result<()> {
        let run_id = core.run_id().clone();
        let store = Arc::clone(core.store());

        let (tx, rx) = mpsc::channel::<RuntimeEvent>(EVENT_CHANNEL_CAPACITY);
        let invoker = GenerationInvoker::new(
            Arc::clone(&self.collaborator),
            store,
            RetryPolicy::from(pipeline.config.retry),
        );
        let runner = NodeRunner::new(invoker, self.assessor.clone(), pipeline.config.refinement);
        let executor = RealExecutorBackend::new(runner, tx.clone());

        let (report_tx, report_rx) = watch::channel(core.report());
        let mut runtime = Runtime::new(core, rx, tx.clone(), executor).with_reports(report_tx);
        if let Some(dir) = &pipeline.config.state_dir {
            runtime = runtime.with_checkpoints(CheckpointStore::new(Arc::clone(&self.fs), dir));
        }

        let join = tokio::spawn(runtime.run());
        self.lock().insert(
            run_id,
            RunHandle {
                events: tx,
                reports: report_rx,
                join: Some(join),
            },
        );
        Ok(())
    }

    async fn send(&self, run_id: &str, event: RuntimeEvent) -> Result<()> {
        let events = {
            let runs = self.lock();
            runs.get(run_id)
                .ok_or_else(|| DocdagError::UnknownRun(run_id.to_string()))?
                .events
                .clone()
        };
        events
            .send(event)
            .await
            .map_err(|_| DocdagError::Config(format!("run '{run_id}' is no longer running")))
    }

    /// Best explanation for a resume that could not be delivered.
    fn inactive_resume_error(&self, run_id: &str, node: &str) -> DocdagError {
        let report = match self.status(run_id) {
            Ok(report) => report,
            Err(e) => return e,
        };
        match report.state_of(node) {
            None => DocdagError::UnknownNode(node.to_string()),
            Some(state) if state != NodeState::AwaitingHuman => DocdagError::NotAwaitingHuman {
                node: NodeId::from(node),
                state: state.to_string(),
            },
            Some(_) => DocdagError::Config(format!(
                "run '{run_id}' stopped while node '{node}' was awaiting input; resume it from its checkpoint"
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
