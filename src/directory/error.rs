//! Directory error types

use crate::directory::client::CleanupSummary;
use thiserror::Error;

/// Failure talking to one index-service endpoint.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Transport-level HTTP failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("index returned status {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Start of the response body
        body: String,
    },

    /// Response body did not have the expected shape
    #[error("unexpected index response: {0}")]
    Decode(String),

    /// Endpoint is known to be down
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// Endpoint URL could not be parsed
    #[error("invalid endpoint URL '{url}': {reason}")]
    InvalidUrl {
        /// Configured URL
        url: String,
        /// Parser message
        reason: String,
    },
}

impl IndexError {
    /// Rank used to keep the most informative cause across endpoints.
    pub(crate) fn specificity(&self) -> u8 {
        match self {
            IndexError::Unavailable(_) => 0,
            IndexError::Http(e) if e.is_connect() => 1,
            IndexError::Http(_) => 2,
            IndexError::InvalidUrl { .. } => 3,
            IndexError::Decode(_) => 4,
            IndexError::Status { .. } => 5,
        }
    }
}

/// Failure of a logical directory operation.
///
/// `Unavailable` means no endpoint could be reached at all, which callers
/// must keep distinct from an operation that succeeded with no results.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Every configured endpoint failed to connect
    #[error("could not reach the directory service ({endpoints} endpoint(s) tried): {source}")]
    Unavailable {
        /// Endpoints tried
        endpoints: usize,
        /// Most specific cause observed
        #[source]
        source: IndexError,
    },

    /// Connected, but the operation kept failing
    #[error("directory operation '{operation}' failed after {attempts} attempt(s): {source}")]
    Operation {
        /// Operation name
        operation: &'static str,
        /// Attempts made
        attempts: usize,
        /// Last failure
        #[source]
        source: IndexError,
    },

    /// Exit cleanup stopped part way
    #[error("exit cleanup incomplete (completed: {completed}): {source}")]
    Cleanup {
        /// Stages that did complete
        completed: CleanupSummary,
        /// Failure of the first stage that did not
        #[source]
        source: Box<DirectoryError>,
    },

    /// Caller passed something unusable
    #[error("invalid directory input: {0}")]
    InvalidInput(String),
}

impl DirectoryError {
    /// True when the directory could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        match self {
            DirectoryError::Unavailable { .. } => true,
            DirectoryError::Cleanup { source, .. } => source.is_unavailable(),
            _ => false,
        }
    }
}
