// src/exec/command.rs

//! Process-backed collaborators.
//!
//! Both collaborators run a configured shell command with
//! `tokio::process::Command`, write a JSON request to its stdin and parse a
//! JSON response from its stdout.
//!
//! Exit codes map onto [`GenerationError`] kinds:
//! - `0`: success; stdout must parse, otherwise the error is permanent.
//! - `64..=78` (sysexits usage/data errors): permanent.
//! - anything else, including death by signal: retryable.

use std::process::Stdio;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::GenerationError;
use crate::generation::{
    Assessment, BoxFuture, GenerationCollaborator, GenerationOutput, InputContext,
    QualityAssessor,
};

/// Environment variable carrying the node id into collaborator commands.
pub const NODE_ENV: &str = "DOCDAG_NODE";

const PERMANENT_EXIT_CODES: std::ops::RangeInclusive<i32> = 64..=78;

/// Runs the `generate` command for each draft.
#[derive(Debug, Clone)]
pub struct CommandCollaborator {
    command: String,
}

impl CommandCollaborator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl GenerationCollaborator for CommandCollaborator {
    fn invoke<'a>(
        &'a self,
        node_id: &'a str,
        context: &'a InputContext,
    ) -> BoxFuture<'a, Result<GenerationOutput, GenerationError>> {
        Box::pin(run_json_command(&self.command, node_id, context))
    }
}

#[derive(Serialize)]
struct AssessRequest<'a> {
    content: &'a str,
    context: &'a InputContext,
}

/// Runs the `assess` command for each refinement iteration.
#[derive(Debug, Clone)]
pub struct CommandAssessor {
    command: String,
}

impl CommandAssessor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl QualityAssessor for CommandAssessor {
    fn assess<'a>(
        &'a self,
        content: &'a str,
        context: &'a InputContext,
    ) -> BoxFuture<'a, Result<Assessment, GenerationError>> {
        Box::pin(async move {
            let request = AssessRequest { content, context };
            let mut assessment: Assessment =
                run_json_command(&self.command, &context.node_id, &request).await?;
            assessment.score = assessment.score.min(100);
            Ok(assessment)
        })
    }
}

async fn run_json_command<T, R>(
    command: &str,
    node_id: &str,
    request: &R,
) -> Result<T, GenerationError>
where
    T: DeserializeOwned,
    R: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(request)
        .map_err(|e| GenerationError::permanent(format!("encoding request: {e}")))?;

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };
    cmd.env(NODE_ENV, node_id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(node = %node_id, cmd = %command, "spawning collaborator process");
    let mut child = cmd
        .spawn()
        .map_err(|e| GenerationError::retryable(format!("spawning '{command}': {e}")))?;

    // Feed stdin while stdout is drained; either side may fill its pipe first.
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            if let Err(e) = stdin.write_all(&payload).await {
                // The command may legitimately ignore its input.
                debug!(node = %node_id, error = %e, "collaborator closed stdin early");
            }
        }
    };
    let ((), output) = tokio::join!(feed, child.wait_with_output());
    let output =
        output.map_err(|e| GenerationError::retryable(format!("waiting for '{command}': {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        debug!(node = %node_id, "collaborator stderr: {}", stderr.trim());
    }

    if !output.status.success() {
        let code = output.status.code();
        let message = format!(
            "'{command}' exited with {}: {}",
            code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            stderr.trim()
        );
        warn!(node = %node_id, exit_code = ?code, "collaborator process failed");
        return Err(match code {
            Some(c) if PERMANENT_EXIT_CODES.contains(&c) => GenerationError::permanent(message),
            _ => GenerationError::retryable(message),
        });
    }

    serde_json::from_slice(&output.stdout).map_err(|e| {
        GenerationError::permanent(format!("unparsable output from '{command}': {e}"))
    })
}
