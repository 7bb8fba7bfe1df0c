//! Error types for the coremesh crate.

use thiserror::Error;

/// Errors that can occur while supervising a run.
#[derive(Error, Debug)]
pub enum CoreMeshError {
    #[error("Failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} exited early: {status}")]
    EarlyExit { name: String, status: String },

    #[error("{name} exited with error: {status}")]
    EdgeFailed { name: String, status: String },

    #[error("System proxy error: {0}")]
    SystemProxy(String),

    #[error("No usable proxy endpoint: {0}")]
    EndpointNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Geo asset error: {0}")]
    Asset(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("State file {path}: {reason}")]
    StateFile { path: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for coremesh operations.
pub type Result<T> = std::result::Result<T, CoreMeshError>;
