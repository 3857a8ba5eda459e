//! Error types shared across the plugin and sandbox layers.

use std::path::PathBuf;

/// Failures talking to a sandbox generation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The sandbox child process could not be started.
    #[error("Sandbox: failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox: I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A request or response could not be encoded or decoded.
    #[error("Sandbox: protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The call did not complete within the configured per-call timeout.
    #[error("Sandbox: '{op}' timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    /// The sandbox went away (torn down, crashed, or closed its stdout).
    #[error("Sandbox: generation {0} is closed")]
    Closed(u64),

    /// The operation ran inside the sandbox and failed there.
    #[error("Sandbox: {0}")]
    Remote(String),
}

/// Failures loading or inspecting plugin modules.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin: cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Plugin: cannot parse manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// The manifest parsed but failed static validation.
    #[error("Plugin: invalid manifest {}: {}", .path.display(), .reasons.join("; "))]
    Invalid { path: PathBuf, reasons: Vec<String> },

    #[error("Plugin: snapshot of {} failed: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// A raw telemetry value could not be converted to a field's declared type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("field '{field}' has no value '{source_field}' on instance '{instance}'")]
    Missing {
        field: String,
        source_field: String,
        instance: String,
    },

    #[error("field '{field}': cannot convert {raw} to {target}")]
    Incompatible {
        field: String,
        raw: String,
        target: &'static str,
    },
}
