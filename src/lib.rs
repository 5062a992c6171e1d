// src/lib.rs

pub mod cli;
pub mod condition;
pub mod config;
pub mod control;
pub mod crossref;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod generation;
pub mod logging;
pub mod report;
pub mod store;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::cli::{CliArgs, Command, ResumeArgs, RunArgs, StatusArgs};
use crate::config::loader::{load_inputs, load_payload};
use crate::config::{InitialInputs, PipelineFile, load_and_validate};
use crate::control::PipelineController;
use crate::dag::{NodeState, PipelineGraph};
use crate::engine::{CoreRuntime, RuntimeOptions};
use crate::exec::{CommandAssessor, CommandCollaborator};
use crate::fs::{FileSystem, RealFileSystem};
use crate::report::{RunReport, RunStatus};
use crate::store::CheckpointStore;

/// High-level entry point used by `main.rs`.
///
/// Returns whether the run ended clean (every node Completed or Skipped, no
/// `error` findings). A run suspended on a human gate counts as clean.
pub async fn run(args: CliArgs) -> Result<bool> {
    match args.command {
        Command::Run(a) => run_pipeline(a).await,
        Command::Resume(a) => resume_pipeline(a).await,
        Command::Status(a) => show_status(a),
    }
}

async fn run_pipeline(args: RunArgs) -> Result<bool> {
    let pipeline = load_and_validate(&args.pipeline)
        .with_context(|| format!("loading pipeline {}", args.pipeline))?;

    if args.dry_run {
        print_dry_run(&pipeline)?;
        return Ok(true);
    }

    let inputs = match &args.inputs {
        Some(path) => load_inputs(&RealFileSystem, Path::new(path))
            .with_context(|| format!("loading inputs {path}"))?,
        None => InitialInputs::new(),
    };
    if pipeline.config.state_dir.is_none() {
        warn!("[config].state_dir is not set; a suspended run cannot be resumed later");
    }

    let controller = Arc::new(build_controller(&pipeline)?);
    let run_id = controller.start(&pipeline, inputs)?;
    println!("run {run_id}");

    drive(controller, &run_id, &args.pipeline).await
}

async fn resume_pipeline(args: ResumeArgs) -> Result<bool> {
    let pipeline = load_and_validate(&args.pipeline)
        .with_context(|| format!("loading pipeline {}", args.pipeline))?;
    let checkpoints = checkpoint_store(&pipeline)?;
    let checkpoint = checkpoints.load(&args.run)?;
    let payload = load_payload(&RealFileSystem, Path::new(&args.payload))
        .with_context(|| format!("loading payload {}", args.payload))?;

    let controller = Arc::new(build_controller(&pipeline)?);
    controller.restore_and_resume(&pipeline, &checkpoint, &args.node, payload)?;
    info!(run_id = %args.run, node = %args.node, "resumed run");

    drive(controller, &args.run, &args.pipeline).await
}

fn show_status(args: StatusArgs) -> Result<bool> {
    let pipeline = load_and_validate(&args.pipeline)
        .with_context(|| format!("loading pipeline {}", args.pipeline))?;
    let checkpoints = checkpoint_store(&pipeline)?;

    let Some(run_id) = args.run else {
        let runs = checkpoints.list()?;
        if runs.is_empty() {
            println!("no runs in {}", checkpoints.dir().display());
        }
        for run in runs {
            println!("{run}");
        }
        return Ok(true);
    };

    let checkpoint = checkpoints.load(&run_id)?;
    let core = CoreRuntime::from_checkpoint(&pipeline, &checkpoint, RuntimeOptions::default())?;
    let report = core.report();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(report_is_acceptable(&report))
}

/// Wait for the run to stop (finished or suspended) and print its report.
/// Ctrl-C stops the runtime but leaves the run resumable.
async fn drive(controller: Arc<PipelineController>, run_id: &str, pipeline_path: &str) -> Result<bool> {
    {
        let controller = Arc::clone(&controller);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = controller.shutdown(&run_id).await;
        });
    }

    let report = controller.wait(run_id).await?;
    print!("{}", report.render());

    let awaiting = report.nodes_in(NodeState::AwaitingHuman);
    if !report.is_finished() && !awaiting.is_empty() {
        println!();
        println!("run suspended; awaiting human input on: {}", awaiting.join(", "));
        for node in awaiting {
            println!(
                "  docdag resume --pipeline {pipeline_path} --run {run_id} --node {node} --payload <file.json>"
            );
        }
    }
    Ok(report_is_acceptable(&report))
}

fn report_is_acceptable(report: &RunReport) -> bool {
    match report.status {
        RunStatus::Completed => report.is_clean(),
        RunStatus::Running | RunStatus::AwaitingHuman => report.error_findings().next().is_none(),
        RunStatus::Halted | RunStatus::Cancelled => false,
    }
}

fn build_controller(pipeline: &PipelineFile) -> Result<PipelineController> {
    let Some(generate) = &pipeline.collaborator.generate else {
        bail!("[collaborator].generate must name the drafting command");
    };
    let mut controller = PipelineController::new(Arc::new(CommandCollaborator::new(generate.clone())))
        .with_exit_when_quiescent(true);
    if let Some(assess) = &pipeline.collaborator.assess {
        controller = controller.with_assessor(Arc::new(CommandAssessor::new(assess.clone())));
    }
    Ok(controller)
}

fn checkpoint_store(pipeline: &PipelineFile) -> Result<CheckpointStore> {
    let Some(dir) = &pipeline.config.state_dir else {
        bail!("[config].state_dir must be set to resume or inspect runs");
    };
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    Ok(CheckpointStore::new(fs, dir.clone()))
}

/// Dry-run output: nodes by tier with dependencies, conditions, gates and
/// rules.
fn print_dry_run(pipeline: &PipelineFile) -> Result<()> {
    let graph = PipelineGraph::build(&pipeline.node)?;

    println!("docdag dry-run");
    println!("  config.workers = {}", pipeline.config.workers);
    println!("  config.node_retries = {}", pipeline.config.node_retries);
    println!("  config.halt_on_error = {}", pipeline.config.halt_on_error);
    if !pipeline.config.inputs.is_empty() {
        println!("  config.inputs = {:?}", pipeline.config.inputs);
    }
    println!();

    for (tier, nodes) in graph.tiers() {
        println!("tier {tier}:");
        for id in nodes {
            println!("  - {id}");
            let deps = graph.dependencies_of(&id);
            if !deps.is_empty() {
                println!("      after: {deps:?}");
            }
            for (on, predicate) in graph.conditions_of(&id) {
                println!("      when ({on}): {}", serde_json::to_string(predicate)?);
            }
            let Some(node) = pipeline.node.get(&id) else {
                continue;
            };
            if node.requires_human_input {
                match &node.human_gate_timeout {
                    Some(t) => println!("      human gate (timeout {t})"),
                    None => println!("      human gate"),
                }
            }
            if node.refine {
                println!("      refine: true");
            }
            for (alias, source) in &node.data_sources {
                let fields = if source.fields.is_empty() {
                    "*".to_string()
                } else {
                    source.fields.join(", ")
                };
                let required = if source.required { "" } else { " (optional)" };
                println!("      input {alias}: {}[{fields}]{required}", source.node);
            }
        }
    }

    if !pipeline.rule.is_empty() {
        println!();
        println!("rules ({}):", pipeline.rule.len());
        for rule in &pipeline.rule {
            let docs: Vec<String> = rule
                .referenced_fields()
                .into_iter()
                .map(|f| f.to_string())
                .collect();
            println!("  - {} [{:?}] {}", rule.id, rule.severity, docs.join(", "));
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
