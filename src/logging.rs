// src/logging.rs

//! Tracing subscriber for the `docdag` binary.
//!
//! `--log-level` wins over `DOCDAG_LOG`. The environment variable accepts
//! full filter directives such as `docdag::engine=debug,info`, so a single
//! module can be turned up without flooding the rest. Without either, only
//! `info` and above is shown.
//!
//! Everything goes to stderr; stdout is reserved for run reports.

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogLevel;

const ENV_VAR: &str = "DOCDAG_LOG";

pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(directive(level)),
        None => filter_from_env(std::env::var(ENV_VAR).ok().as_deref())?,
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing tracing subscriber: {e}"))
}

fn directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    }
}

fn filter_from_env(raw: Option<&str>) -> Result<EnvFilter> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(EnvFilter::new("info")),
        // `warning` is common enough in the wild to accept.
        Some(s) if s.eq_ignore_ascii_case("warning") => Ok(EnvFilter::new("warn")),
        Some(s) => EnvFilter::try_new(s.to_lowercase())
            .with_context(|| format!("invalid {ENV_VAR} filter {s:?}")),
    }
}
