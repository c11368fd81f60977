//! Error types for the depot server.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the intake and build pipeline.
#[derive(Error, Debug)]
pub enum ServerError {
    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A filesystem move failed after validation passed.
    #[error("error moving {from} to {to}: {source}")]
    Move {
        /// Source path of the failed move.
        from: PathBuf,
        /// Destination path of the failed move.
        to: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
