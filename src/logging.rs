//! Diagnostic logging setup.
//!
//! Everything goes to stderr: the sandbox child's stdout carries the
//! protocol, and it inherits the agent's stderr so both logs interleave.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "monagent=info";

/// Builds the filter from an explicit level, else `RUST_LOG`, else the default.
pub fn filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter '{level}'")),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Installs the global subscriber. Call once, before anything logs.
pub fn init(level: Option<&str>, json: bool) -> Result<()> {
    let filter = filter(level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}
