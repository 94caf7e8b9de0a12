//! Error taxonomy for terrarun.

use std::path::PathBuf;

/// Errors raised while resolving what to run.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("workflow not found: {name}")]
    WorkflowNotFound { name: String },

    #[error("invalid step {index} in workflow {workflow}: {reason}")]
    InvalidStep {
        workflow: String,
        index: usize,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors loading configuration files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for terrarun core operations.
pub type Result<T> = std::result::Result<T, RunnerError>;
