//! Error types shared across the workspace
//!
//! Subsystems define their own error enums next to the code that raises
//! them; this is the root type for configuration, local I/O and metrics.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for peershare
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
