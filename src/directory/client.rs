//! Failover-aware directory client.
//!
//! Holds one logical connection to the index service, backed by several
//! equivalent endpoints. Connection state is owned by a single async mutex;
//! operations clone the current session out of it and run concurrently.
//! A failing operation drops the session, advances to the next endpoint and
//! retries, up to `max_attempts` attempts in total.

use crate::directory::documents::{decode_file, decode_peer, file_document, peer_document, peer_presence};
use crate::directory::error::{DirectoryError, IndexError};
use crate::directory::index::{IndexConnector, IndexSession};
use crate::directory::query::{Filter, Query};
use crate::directory::solr::SolrConnector;
use peershare_core::constants::fields;
use peershare_core::core::IndexConfig;
use peershare_core::system::Metrics;
use peershare_core::types::peer_id;
use peershare_core::{log_debug, log_info, log_warn, FileRecord, PeerRecord, PeerStatus, UpdateOperation};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Rows requested when every matching document is wanted.
const ALL_ROWS: usize = i32::MAX as usize;

struct Connection {
    /// Endpoint currently used, or the next to try
    index: usize,
    session: Option<Arc<dyn IndexSession>>,
    /// Bumped on every (re)connect so stale failures don't advance twice
    generation: u64,
}

/// Stages of exit cleanup that completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Peer record flipped to offline
    pub marked_offline: bool,
    /// File records deleted, once that stage ran
    pub files_removed: Option<usize>,
    /// Deletions made visible
    pub committed: bool,
}

impl fmt::Display for CleanupSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages = Vec::new();
        if self.marked_offline {
            stages.push("marked offline".to_string());
        }
        if let Some(n) = self.files_removed {
            stages.push(format!("removed {} file record(s)", n));
        }
        if self.committed {
            stages.push("committed".to_string());
        }
        if stages.is_empty() {
            f.write_str("nothing")
        } else {
            f.write_str(&stages.join(", "))
        }
    }
}

/// Single logical connection to the replicated directory.
pub struct DirectoryClient {
    connector: Arc<dyn IndexConnector>,
    endpoints: Vec<String>,
    max_attempts: usize,
    search_rows: usize,
    peer_rows: usize,
    state: Mutex<Connection>,
    /// Serialises batch updates so two syncs never interleave
    batch_lock: Mutex<()>,
}

impl DirectoryClient {
    /// Client over an arbitrary index backend.
    pub fn new(config: &IndexConfig, connector: Arc<dyn IndexConnector>) -> Result<Self, DirectoryError> {
        if config.endpoints.is_empty() {
            return Err(DirectoryError::InvalidInput("no index endpoints configured".into()));
        }
        Ok(Self {
            connector,
            endpoints: config.endpoints.clone(),
            max_attempts: config.max_attempts.max(1),
            search_rows: config.search_rows,
            peer_rows: config.peer_rows,
            state: Mutex::new(Connection { index: 0, session: None, generation: 0 }),
            batch_lock: Mutex::new(()),
        })
    }

    /// Client over Solr-compatible HTTP endpoints.
    pub fn solr(config: &IndexConfig) -> Result<Self, DirectoryError> {
        let connector = SolrConnector::new(config)
            .map_err(|e| DirectoryError::Unavailable { endpoints: 0, source: e })?;
        Self::new(config, Arc::new(connector))
    }

    /// Endpoint of the live session, if any
    pub async fn current_endpoint(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.session.as_ref().map(|s| s.endpoint().to_string())
    }

    /// Make sure a verified session exists.
    ///
    /// A believed-live session is probed first; if the probe fails the
    /// endpoint search starts from that endpoint.
    pub async fn connect(&self) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.clone() {
            match session.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log_warn!("Directory endpoint {} failed liveness probe: {}", session.endpoint(), e);
                    state.session = None;
                }
            }
        }
        self.connect_locked(&mut state).await.map(|_| ())
    }

    /// Drop the current session.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.take() {
            log_info!("Disconnected from directory endpoint {}", session.endpoint());
        }
    }

    /// Try each endpoint once, starting at the last known good one.
    async fn connect_locked(&self, state: &mut Connection) -> Result<Arc<dyn IndexSession>, DirectoryError> {
        let count = self.endpoints.len();
        let mut cause: Option<IndexError> = None;

        for offset in 0..count {
            let index = (state.index + offset) % count;
            let endpoint = &self.endpoints[index];
            match self.open(endpoint).await {
                Ok(session) => {
                    log_info!("Connected to directory endpoint {}", endpoint);
                    state.index = index;
                    state.session = Some(session.clone());
                    state.generation += 1;
                    return Ok(session);
                }
                Err(e) => {
                    log_warn!("Directory endpoint {} unreachable: {}", endpoint, e);
                    let more_specific = cause
                        .as_ref()
                        .map_or(true, |c| e.specificity() >= c.specificity());
                    if more_specific {
                        cause = Some(e);
                    }
                }
            }
        }

        Err(DirectoryError::Unavailable {
            endpoints: count,
            source: cause.unwrap_or_else(|| IndexError::Unavailable("no endpoints".into())),
        })
    }

    async fn open(&self, endpoint: &str) -> Result<Arc<dyn IndexSession>, IndexError> {
        let session = self.connector.connect(endpoint).await?;
        session.ping().await?;
        Ok(session)
    }

    /// Current session and its generation, connecting if needed.
    async fn session(&self) -> Result<(Arc<dyn IndexSession>, u64), DirectoryError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.clone() {
            return Ok((session, state.generation));
        }
        let session = self.connect_locked(&mut state).await?;
        Ok((session, state.generation))
    }

    /// Drop a session that just failed and move to the next endpoint.
    async fn fail_over(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.session.is_none() {
            return;
        }
        state.session = None;
        state.index = (state.index + 1) % self.endpoints.len();
        Metrics::global().directory.failovers.inc();
        log_info!("Failing over to directory endpoint {}", self.endpoints[state.index]);
    }

    /// Run `op` with retry and failover.
    async fn with_failover<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, DirectoryError>
    where
        F: FnMut(Arc<dyn IndexSession>) -> Fut,
        Fut: Future<Output = Result<T, IndexError>>,
    {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            let (session, generation) = match self.session().await {
                Ok(found) => found,
                Err(e) => {
                    log_warn!("{}: attempt {}/{} could not connect: {}", operation, attempt, self.max_attempts, e);
                    last_error = Some(e);
                    continue;
                }
            };

            match op(session.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    log_warn!(
                        "{}: attempt {}/{} failed on {}: {}",
                        operation,
                        attempt,
                        self.max_attempts,
                        session.endpoint(),
                        e
                    );
                    self.fail_over(generation).await;
                    last_error = Some(DirectoryError::Operation { operation, attempts: attempt, source: e });
                }
            }
        }

        Metrics::global().directory.operations_failed.inc();
        Err(last_error.unwrap_or_else(|| DirectoryError::InvalidInput(format!("{} was not attempted", operation))))
    }

    /// Create or overwrite the peer's record with its status and address.
    pub async fn register_peer(&self, peer: &PeerRecord) -> Result<(), DirectoryError> {
        validate_username(&peer.username)?;
        let doc = peer_document(peer);
        self.with_failover("register_peer", |session| {
            let doc = doc.clone();
            async move { session.upsert(vec![doc]).await }
        })
        .await?;
        log_info!("Registered peer '{}' at {} ({})", peer.username, peer.addr(), peer.status);
        Ok(())
    }

    /// Update status, address and port of a peer together.
    pub async fn set_peer_status(&self, peer: &PeerRecord) -> Result<(), DirectoryError> {
        validate_username(&peer.username)?;
        let id = peer_id(&peer.username);
        let updates = peer_presence(peer);
        self.with_failover("set_peer_status", |session| {
            let (id, updates) = (id.clone(), updates.clone());
            async move { session.set_fields(&id, updates).await }
        })
        .await?;
        log_info!("Peer '{}' is now {}", peer.username, peer.status);
        Ok(())
    }

    /// Publish and retract files as one batch.
    ///
    /// Batches are serialised per client. A retried batch is re-sent whole;
    /// adds overwrite and deletes of missing ids are no-ops.
    pub async fn apply_file_updates(&self, operations: &[UpdateOperation]) -> Result<(), DirectoryError> {
        if operations.is_empty() {
            return Ok(());
        }
        let _batch = self.batch_lock.lock().await;

        let mut adds = Vec::new();
        let mut removes = Vec::new();
        for op in operations {
            match op {
                UpdateOperation::Add(record) => adds.push(file_document(record)),
                UpdateOperation::Remove(record) => removes.push(record.resolved_id()),
            }
        }

        let (adds, removes) = (&adds, &removes);
        self.with_failover("apply_file_updates", move |session| async move {
            if !adds.is_empty() {
                session.upsert(adds.clone()).await?;
            }
            if !removes.is_empty() {
                session.delete_by_ids(removes.clone()).await?;
            }
            Ok::<_, IndexError>(())
        })
        .await?;
        log_info!("Applied {} file addition(s) and {} removal(s)", adds.len(), removes.len());
        Ok(())
    }

    /// Every file record owned by `owner`.
    pub async fn find_files_by_owner(&self, owner: &str) -> Result<Vec<FileRecord>, DirectoryError> {
        validate_username(owner)?;
        let query = Query::new(
            Filter::And(vec![
                Filter::eq(fields::DOC_TYPE, fields::DOC_TYPE_FILE),
                Filter::eq(fields::OWNER, owner),
            ]),
            &[fields::ID, fields::FILENAME, fields::SIZE, fields::OWNER],
            ALL_ROWS,
        );
        let query = &query;
        let docs = self
            .with_failover("find_files_by_owner", move |session| async move { session.query(query).await })
            .await?;
        Ok(docs.iter().map(|doc| decode_file(doc, None)).collect())
    }

    /// Online peers other than `excluded`, keyed by username.
    pub async fn online_peers_except(&self, excluded: &str) -> Result<HashMap<String, PeerRecord>, DirectoryError> {
        let query = self.online_peers_query(excluded);
        let query = &query;
        let docs = self
            .with_failover("online_peers_except", move |session| async move { session.query(query).await })
            .await?;
        Ok(collect_peers(&docs))
    }

    fn online_peers_query(&self, excluded: &str) -> Query {
        let mut clauses = vec![
            Filter::eq(fields::DOC_TYPE, fields::DOC_TYPE_PEER),
            Filter::eq(fields::STATUS, PeerStatus::Online.as_str()),
        ];
        if !excluded.trim().is_empty() {
            clauses.push(Filter::not(Filter::eq(fields::USERNAME, excluded)));
        }
        Query::new(
            Filter::And(clauses),
            &[fields::USERNAME, fields::IP, fields::PORT, fields::STATUS],
            self.peer_rows,
        )
    }

    /// Files of other online peers whose name matches `text`.
    ///
    /// Both phases run on the same session so a failover retries the whole
    /// search. A blank `text` lists every file of every online peer.
    pub async fn search_files(&self, text: &str, requester: &str) -> Result<Vec<FileRecord>, DirectoryError> {
        let peers_query = self.online_peers_query(requester);
        let (peers_query, text) = (&peers_query, text.trim());
        let search_rows = self.search_rows;

        let results = self
            .with_failover("search_files", move |session| async move {
                let peers = collect_peers(&session.query(peers_query).await?);
                if peers.is_empty() {
                    log_debug!("No other online peers; skipping file query for '{}'", text);
                    return Ok::<_, IndexError>(Vec::new());
                }

                let mut clauses = vec![
                    Filter::eq(fields::DOC_TYPE, fields::DOC_TYPE_FILE),
                    Filter::any_of(fields::OWNER, peers.keys().cloned()),
                ];
                if !text.is_empty() {
                    clauses.push(Filter::matches(fields::FILENAME_TEXT, text));
                }
                let files_query = Query::new(
                    Filter::And(clauses),
                    &[fields::ID, fields::FILENAME, fields::SIZE, fields::OWNER],
                    search_rows,
                );

                let hits = session.query(&files_query).await?;
                Ok(hits
                    .iter()
                    .filter_map(|doc| {
                        let record = decode_file(doc, None);
                        match peers.get(&record.owner) {
                            Some(owner) => Some(FileRecord { owner_addr: Some(owner.addr()), ..record }),
                            None => {
                                log_debug!("Dropping '{}': owner '{}' went offline", record.filename, record.owner);
                                None
                            }
                        }
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        log_info!("Search for '{}' found {} file(s)", text, results.len());
        Ok(results)
    }

    /// Delete every file record of `owner` and commit. Returns how many.
    pub async fn remove_user_files(&self, owner: &str) -> Result<usize, DirectoryError> {
        validate_username(owner)?;
        let query = Query::new(
            Filter::And(vec![
                Filter::eq(fields::DOC_TYPE, fields::DOC_TYPE_FILE),
                Filter::eq(fields::OWNER, owner),
            ]),
            &[fields::ID],
            ALL_ROWS,
        );
        let query = &query;
        let removed = self
            .with_failover("remove_user_files", move |session| async move {
                let ids: Vec<String> = session
                    .query(query)
                    .await?
                    .iter()
                    .filter_map(|doc| crate::directory::documents::str_field(doc, fields::ID).map(str::to_string))
                    .collect();
                let count = ids.len();
                if count > 0 {
                    session.delete_by_ids(ids).await?;
                    session.commit().await?;
                }
                Ok::<_, IndexError>(count)
            })
            .await?;
        log_info!("Removed {} file record(s) of '{}'", removed, owner);
        Ok(removed)
    }

    /// Make all writes visible now.
    pub async fn commit(&self) -> Result<(), DirectoryError> {
        self.with_failover("commit", |session| async move { session.commit().await }).await
    }

    /// Mark the peer offline, delete its files, then commit.
    ///
    /// Stops at the first failing stage and reports what completed.
    pub async fn cleanup_on_exit(&self, peer: &PeerRecord) -> Result<CleanupSummary, DirectoryError> {
        let mut summary = CleanupSummary::default();
        let offline = PeerRecord { status: PeerStatus::Offline, ..peer.clone() };

        if let Err(e) = self.set_peer_status(&offline).await {
            return Err(cleanup_error(summary, e));
        }
        summary.marked_offline = true;

        match self.remove_user_files(&peer.username).await {
            Ok(n) => summary.files_removed = Some(n),
            Err(e) => return Err(cleanup_error(summary, e)),
        }

        if let Err(e) = self.commit().await {
            return Err(cleanup_error(summary, e));
        }
        summary.committed = true;

        log_info!("Exit cleanup for '{}': {}", peer.username, summary);
        Ok(summary)
    }
}

fn cleanup_error(completed: CleanupSummary, source: DirectoryError) -> DirectoryError {
    DirectoryError::Cleanup { completed, source: Box::new(source) }
}

fn collect_peers(docs: &[crate::directory::index::Document]) -> HashMap<String, PeerRecord> {
    docs.iter()
        .filter_map(decode_peer)
        .filter(|peer| peer.status == PeerStatus::Online)
        .map(|peer| (peer.username.clone(), peer))
        .collect()
}

fn validate_username(username: &str) -> Result<(), DirectoryError> {
    if username.trim().is_empty() {
        return Err(DirectoryError::InvalidInput("username must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_summary_display() {
        assert_eq!(CleanupSummary::default().to_string(), "nothing");
        let summary = CleanupSummary { marked_offline: true, files_removed: Some(2), committed: false };
        assert_eq!(summary.to_string(), "marked offline, removed 2 file record(s)");
    }

    #[test]
    fn test_new_requires_endpoints() {
        let config = IndexConfig { endpoints: Vec::new(), ..IndexConfig::default() };
        let connector = Arc::new(crate::directory::MemoryCluster::new(["a"]));
        assert!(matches!(
            DirectoryClient::new(&config, connector),
            Err(DirectoryError::InvalidInput(_))
        ));
    }
}
