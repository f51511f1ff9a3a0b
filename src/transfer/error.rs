//! Transfer error taxonomy

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why a download did not complete.
#[derive(Error, Debug)]
pub enum TransferError {
    /// The remote peer answered with an ERROR frame
    #[error("peer rejected the request: {0}")]
    Rejected(String),

    /// No bytes arrived within the stall window
    #[error("transfer stalled after {received} of {expected} bytes")]
    Stalled {
        /// Bytes received before the stall
        received: u64,
        /// Size announced by the peer
        expected: u64,
    },

    /// Connect or read deadline elapsed
    #[error("timed out waiting for the peer")]
    TimedOut,

    /// Socket-level failure
    #[error("network error: {0}")]
    Network(#[source] io::Error),

    /// The peer sent something that is not valid framing
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Destination could not be created or written
    #[error("local I/O error on {}: {source}", path.display())]
    LocalIo {
        /// File or directory being written
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// The client shut down before the download finished
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Wrap a socket error, splitting out malformed data.
    pub fn network(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::InvalidData {
            TransferError::Protocol(err.to_string())
        } else {
            TransferError::Network(err)
        }
    }

    /// Wrap a local file error
    pub fn local(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::LocalIo { path: path.into(), source }
    }

    /// Whether another attempt could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::TimedOut | TransferError::Stalled { .. } => true,
            TransferError::Network(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
