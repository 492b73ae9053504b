//! Error types shared by every Rig crate.

use thiserror::Error;

/// Top-level error type for orchestration-engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The full set of spec-validation failures, not just the first.
    #[error("spec validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("port allocator exhausted its window after {0} attempts")]
    PortExhausted(usize),

    #[error("artifact resolution failed: {0}")]
    ArtifactFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out after {0:?}: {1}")]
    Timeout(std::time::Duration, String),

    #[error("template error: {0}")]
    Template(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
