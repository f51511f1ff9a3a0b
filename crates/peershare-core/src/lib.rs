//! # Peershare Core
//!
//! Shared data model, configuration, logging and metrics for the peershare
//! peer node and the directory load balancer.

#![warn(missing_docs)]

/// Configuration and logging
pub mod core;

/// Type definitions for peer and file records
pub mod types;

/// System utilities and metrics
pub mod system;

/// System constants
pub mod constants;

// Re-export commonly used items
pub use core::Config;
pub use types::{Error, Result};
pub use types::{FileRecord, PeerRecord, PeerStatus, SyncKey, UpdateOperation};

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
