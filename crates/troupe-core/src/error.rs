//! Error types for the troupe core library.

use thiserror::Error;

use crate::readiness::ReadyError;

/// Result type alias using troupe Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for troupe operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Framework provider failed to construct or preload something
    #[error("Framework error: {0}")]
    Framework(String),

    /// Readiness barrier completed with an error
    #[error("Ready error: {0}")]
    Ready(#[from] ReadyError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
