//! In-process index backend.
//!
//! A [`MemoryCluster`] is a set of named endpoints sharing one document
//! store, standing in for a replicated index service. Endpoints can be taken
//! down or told to fail, which makes failover observable without a network.

use crate::directory::error::IndexError;
use crate::directory::index::{Document, IndexConnector, IndexSession};
use crate::directory::query::Query;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use peershare_core::constants::fields;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct EndpointState {
    available: AtomicBool,
    fail_next: AtomicUsize,
    calls: AtomicUsize,
}

impl EndpointState {
    fn check(&self, endpoint: &str) -> Result<(), IndexError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(IndexError::Unavailable(format!("{} is down", endpoint)));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(IndexError::Unavailable(format!("{} failed the request", endpoint)));
        }
        Ok(())
    }
}

/// Replicated in-memory index with per-endpoint failure injection.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    docs: Arc<RwLock<BTreeMap<String, Document>>>,
    endpoints: Arc<DashMap<String, Arc<EndpointState>>>,
}

impl MemoryCluster {
    /// Cluster with the given endpoints, all available.
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = Self::default();
        for endpoint in endpoints {
            let state = EndpointState::default();
            state.available.store(true, Ordering::SeqCst);
            cluster.endpoints.insert(endpoint.into(), Arc::new(state));
        }
        cluster
    }

    /// Bring an endpoint up or down. Open sessions are affected too.
    pub fn set_available(&self, endpoint: &str, available: bool) {
        if let Some(state) = self.endpoints.get(endpoint) {
            state.available.store(available, Ordering::SeqCst);
        }
    }

    /// Make the next `count` calls against `endpoint` fail.
    pub fn fail_next(&self, endpoint: &str, count: usize) {
        if let Some(state) = self.endpoints.get(endpoint) {
            state.fail_next.store(count, Ordering::SeqCst);
        }
    }

    /// Calls received by `endpoint`, failed ones included
    pub fn call_count(&self, endpoint: &str) -> usize {
        self.endpoints
            .get(endpoint)
            .map(|s| s.calls.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Copy of a stored document
    pub fn document(&self, id: &str) -> Option<Document> {
        self.docs.read().get(id).cloned()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

#[async_trait]
impl IndexConnector for MemoryCluster {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexSession>, IndexError> {
        let state = self
            .endpoints
            .get(endpoint)
            .map(|s| s.value().clone())
            .ok_or_else(|| IndexError::Unavailable(format!("unknown endpoint {}", endpoint)))?;
        state.check(endpoint)?;
        Ok(Arc::new(MemorySession {
            endpoint: endpoint.to_string(),
            state,
            docs: self.docs.clone(),
        }))
    }
}

struct MemorySession {
    endpoint: String,
    state: Arc<EndpointState>,
    docs: Arc<RwLock<BTreeMap<String, Document>>>,
}

fn document_id(doc: &Document) -> Result<String, IndexError> {
    doc.get(fields::ID)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| IndexError::Decode("document without an id".into()))
}

#[async_trait]
impl IndexSession for MemorySession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn ping(&self) -> Result<(), IndexError> {
        self.state.check(&self.endpoint)
    }

    async fn upsert(&self, docs: Vec<Document>) -> Result<(), IndexError> {
        self.state.check(&self.endpoint)?;
        let keyed = docs
            .into_iter()
            .map(|doc| document_id(&doc).map(|id| (id, doc)))
            .collect::<Result<Vec<_>, _>>()?;
        self.docs.write().extend(keyed);
        Ok(())
    }

    async fn set_fields(&self, id: &str, updates: Document) -> Result<(), IndexError> {
        self.state.check(&self.endpoint)?;
        let mut docs = self.docs.write();
        let doc = docs.entry(id.to_string()).or_insert_with(|| {
            let mut fresh = Document::new();
            fresh.insert(fields::ID.into(), id.into());
            fresh
        });
        doc.extend(updates);
        Ok(())
    }

    async fn delete_by_ids(&self, ids: Vec<String>) -> Result<(), IndexError> {
        self.state.check(&self.endpoint)?;
        let mut docs = self.docs.write();
        for id in ids {
            docs.remove(&id);
        }
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, IndexError> {
        self.state.check(&self.endpoint)?;
        let docs = self.docs.read();
        let hits = docs
            .values()
            .filter(|doc| query.filter.evaluate(doc))
            .take(query.rows)
            .map(|doc| {
                if query.fields.is_empty() {
                    doc.clone()
                } else {
                    doc.iter()
                        .filter(|(k, _)| query.fields.iter().any(|f| f == *k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                }
            })
            .collect();
        Ok(hits)
    }

    async fn commit(&self) -> Result<(), IndexError> {
        self.state.check(&self.endpoint)
    }
}
