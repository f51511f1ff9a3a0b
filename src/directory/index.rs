//! Capability set the directory needs from an index service.

use crate::directory::error::IndexError;
use crate::directory::query::Query;
use async_trait::async_trait;
use std::sync::Arc;

/// An index document: field name to JSON value.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Opens sessions against one endpoint of the index service.
#[async_trait]
pub trait IndexConnector: Send + Sync {
    /// Open a session. The caller probes liveness before using it.
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexSession>, IndexError>;
}

/// A live connection to one index-service endpoint.
#[async_trait]
pub trait IndexSession: Send + Sync {
    /// Endpoint this session talks to
    fn endpoint(&self) -> &str;

    /// Lightweight liveness probe
    async fn ping(&self) -> Result<(), IndexError>;

    /// Insert or replace whole documents by id
    async fn upsert(&self, docs: Vec<Document>) -> Result<(), IndexError>;

    /// Set individual fields of one document, leaving the rest untouched
    async fn set_fields(&self, id: &str, fields: Document) -> Result<(), IndexError>;

    /// Delete documents by id; unknown ids are ignored
    async fn delete_by_ids(&self, ids: Vec<String>) -> Result<(), IndexError>;

    /// Run a bounded query
    async fn query(&self, query: &Query) -> Result<Vec<Document>, IndexError>;

    /// Make all previous writes visible to queries
    async fn commit(&self) -> Result<(), IndexError>;
}
