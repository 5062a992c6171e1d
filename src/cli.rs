// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `docdag`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "docdag",
    version,
    about = "Run conditional document pipelines with human gates, cross-document validation and refinement.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DOCDAG_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start a new run of a pipeline.
    Run(RunArgs),
    /// Supply human input for a suspended run and continue it.
    Resume(ResumeArgs),
    /// Show the state of a run, or list runs in the state directory.
    Status(StatusArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Path to the pipeline definition (TOML).
    #[arg(long, value_name = "PATH", default_value = "Docdag.toml")]
    pub pipeline: String,

    /// Initial inputs as a JSON object: `{ "Doc": { "field": value } }`.
    #[arg(long, value_name = "PATH")]
    pub inputs: Option<String>,

    /// Parse + validate, print the nodes by tier, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ResumeArgs {
    #[arg(long, value_name = "PATH", default_value = "Docdag.toml")]
    pub pipeline: String,

    /// Run id printed by `docdag run`.
    #[arg(long, value_name = "ID")]
    pub run: String,

    /// Node awaiting human input.
    #[arg(long, value_name = "NODE")]
    pub node: String,

    /// JSON object with the node's output fields.
    #[arg(long, value_name = "PATH")]
    pub payload: String,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    #[arg(long, value_name = "PATH", default_value = "Docdag.toml")]
    pub pipeline: String,

    /// Run to report on. Lists known runs when omitted.
    #[arg(long, value_name = "ID")]
    pub run: Option<String>,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_resume_subcommand() {
        let args = CliArgs::try_parse_from([
            "docdag", "resume", "--run", "abc", "--node", "Approval", "--payload", "p.json",
            "--log-level", "debug",
        ])
        .unwrap();
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        match args.command {
            Command::Resume(r) => {
                assert_eq!(r.pipeline, "Docdag.toml");
                assert_eq!(r.node, "Approval");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
