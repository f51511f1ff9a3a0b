//! Peershare - peer-to-peer file sharing over a replicated directory.
//!
//! Peers publish the files of a local folder to a directory index service,
//! find files of other online peers through it, and transfer them directly
//! over TCP.
#![warn(missing_docs)]

/// Peer-to-peer file transfer
pub mod transfer;

/// Failover-aware access to the directory index service
pub mod directory;

/// Publish directory synchronisation
pub mod sync;

/// Local address and port helpers
pub mod net;

/// Peer session orchestration
pub mod node;

// Re-export commonly used items for convenience
pub use directory::{DirectoryClient, DirectoryError};
pub use node::{NodeError, PeerNode};
pub use peershare_core::{Config, Error, FileRecord, PeerRecord, Result};
pub use sync::{SyncEngine, SyncReport};
pub use transfer::{TransferClient, TransferError, TransferServer};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
