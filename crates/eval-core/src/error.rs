//! Error taxonomy for the orchestration core.

use std::path::PathBuf;

use eval_state::{AgentKind, StorageError};

/// Errors raised by an agent probe. Always recoverable from the
/// orchestrator's point of view: they count as a failed attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("probe endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid probe response: {0}")]
    InvalidResponse(String),

    #[error("probe failed: {0}")]
    Failed(String),

    #[error("probe cancelled")]
    Cancelled,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors produced by the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("no probe registered for pipeline agent {0}")]
    MissingProbe(AgentKind),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
