//! Shared data model

/// Error types
pub mod error;

/// Derived document identifiers
pub mod ids;

/// Peer records
pub mod peer;

/// File records and update operations
pub mod file;

pub use error::{Error, Result};
pub use file::{FileRecord, SyncKey, UpdateOperation};
pub use ids::{file_id, peer_id};
pub use peer::{PeerRecord, PeerStatus};
