//! Directory of online peers and published files.
//!
//! The directory lives in an external, replicated index service. This module
//! models that service as an [`IndexSession`] capability set, ships an HTTP
//! backend for Solr-compatible services and an in-process backend, and wraps
//! both in [`DirectoryClient`], which hides endpoint failover from callers.

/// Failover client
pub mod client;
/// Record and document mapping
pub mod documents;
/// Error types
pub mod error;
/// Backend traits
pub mod index;
/// In-process backend
pub mod memory;
/// Filter language
pub mod query;
/// Solr-compatible HTTP backend
pub mod solr;

pub use client::{CleanupSummary, DirectoryClient};
pub use error::{DirectoryError, IndexError};
pub use index::{Document, IndexConnector, IndexSession};
pub use memory::MemoryCluster;
pub use query::{Filter, Query};
pub use solr::SolrConnector;
