//! Peer session: join the network, serve and fetch files, leave cleanly.

use crate::directory::{CleanupSummary, DirectoryClient, DirectoryError};
use crate::net;
use crate::sync::{SyncEngine, SyncError, SyncReport};
use crate::transfer::protocol;
use crate::transfer::{DownloadHandle, DownloadRequest, TransferClient, TransferError, TransferServer};
use peershare_core::{log_info, log_warn, Config, FileRecord, PeerRecord};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors surfaced by a peer session
#[derive(Error, Debug)]
pub enum NodeError {
    /// Invalid or missing configuration
    #[error(transparent)]
    Config(#[from] peershare_core::Error),

    /// Directory unreachable or an operation failed
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Publishing local files failed
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A download failed
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// No port to run the transfer server on
    #[error("no free transfer port (configured: {0}, 0 = auto)")]
    NoPort(u16),

    /// Transfer server could not start
    #[error("could not start the transfer server: {0}")]
    Server(#[source] io::Error),

    /// Attempt to download one of our own files
    #[error("'{0}' is shared by this peer")]
    OwnFile(String),

    /// Search hit that cannot be downloaded
    #[error("cannot download '{filename}': {reason}")]
    NotDownloadable {
        /// Filename of the hit
        filename: String,
        /// Why
        reason: &'static str,
    },
}

/// A joined peer: transfer server running, record online, files published.
pub struct PeerNode {
    identity: PeerRecord,
    download_dir: PathBuf,
    directory: Arc<DirectoryClient>,
    server: TransferServer,
    downloads: TransferClient,
    sync: Arc<SyncEngine>,
    resync_task: Option<JoinHandle<()>>,
}

impl PeerNode {
    /// Join using the configured Solr-compatible endpoints.
    pub async fn join(config: &Config) -> Result<Self, NodeError> {
        let directory = Arc::new(DirectoryClient::solr(&config.index)?);
        Self::join_with(config, directory).await
    }

    /// Join through an existing directory client.
    ///
    /// Order: directory, address, transfer server, registration, first sync.
    /// A failure undoes the steps already taken.
    pub async fn join_with(config: &Config, directory: Arc<DirectoryClient>) -> Result<Self, NodeError> {
        config.validate_peer()?;
        let peer = &config.peer;
        tokio::fs::create_dir_all(&peer.publish_dir)
            .await
            .map_err(|e| peershare_core::Error::config(format!(
                "cannot use publish directory {}: {}",
                peer.publish_dir.display(),
                e
            )))?;

        directory.connect().await?;

        let ip = peer.advertise_ip.unwrap_or_else(net::local_ip);
        let port = net::resolve_port(peer.port).ok_or(NodeError::NoPort(peer.port))?;
        let server = TransferServer::start(&config.transfer, port, &peer.publish_dir)
            .await
            .map_err(NodeError::Server)?;
        let identity = PeerRecord::online(peer.username.trim(), ip, server.local_addr().port());

        if let Err(e) = directory.register_peer(&identity).await {
            server.stop().await;
            return Err(e.into());
        }

        let sync = Arc::new(SyncEngine::new(directory.clone(), identity.username.clone(), server.publish_dir()));
        if let Err(e) = sync.synchronize().await {
            log_warn!("Initial sync failed, leaving the network: {}", e);
            if let Err(cleanup) = directory.cleanup_on_exit(&identity).await {
                log_warn!("Cleanup after failed join also failed: {}", cleanup);
            }
            server.stop().await;
            return Err(e.into());
        }

        let resync_task = peer.resync_interval.map(|every| {
            let sync = sync.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = sync.synchronize().await {
                        log_warn!("Periodic sync failed: {}", e);
                    }
                }
            })
        });

        log_info!("Peer '{}' joined at {}", identity.username, identity.addr());
        Ok(Self {
            identity,
            download_dir: peer.download_dir().to_path_buf(),
            directory,
            server,
            downloads: TransferClient::new(&config.transfer),
            sync,
            resync_task,
        })
    }

    /// This peer's record as registered
    pub fn identity(&self) -> &PeerRecord {
        &self.identity
    }

    /// Directory client shared by the session
    pub fn directory(&self) -> &Arc<DirectoryClient> {
        &self.directory
    }

    /// Files published by the last sync
    pub fn shared_files(&self) -> Vec<FileRecord> {
        self.sync.shared_files()
    }

    /// Files of other online peers matching `text`.
    pub async fn search(&self, text: &str) -> Result<Vec<FileRecord>, NodeError> {
        Ok(self.directory.search_files(text, &self.identity.username).await?)
    }

    /// Queue a download of a search hit into the download directory.
    pub fn download(&self, record: &FileRecord) -> Result<DownloadHandle, NodeError> {
        if record.owner == self.identity.username {
            return Err(NodeError::OwnFile(record.filename.clone()));
        }
        if !protocol::is_valid_filename(&record.filename) {
            return Err(NodeError::NotDownloadable {
                filename: record.filename.clone(),
                reason: "name escapes the download directory",
            });
        }
        let destination = self.download_dir.join(&record.filename);
        let request = DownloadRequest::for_record(record, destination).ok_or_else(|| NodeError::NotDownloadable {
            filename: record.filename.clone(),
            reason: "owner address unknown",
        })?;
        Ok(self.downloads.download(request))
    }

    /// Rescan the publish directory now.
    pub async fn resync(&self) -> Result<SyncReport, NodeError> {
        Ok(self.sync.synchronize().await?)
    }

    /// Leave the network.
    ///
    /// Local services always shut down; a failed directory cleanup is
    /// returned after that.
    pub async fn leave(mut self) -> Result<CleanupSummary, NodeError> {
        if let Some(task) = self.resync_task.take() {
            task.abort();
            // A sync in flight must not publish after cleanup has run.
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log_warn!("Periodic sync task failed: {}", e);
                }
            }
        }
        self.server.stop_accepting();

        let cleanup = self.directory.cleanup_on_exit(&self.identity).await;
        if let Err(e) = &cleanup {
            log_warn!("Directory cleanup incomplete: {}", e);
        }

        self.server.stop().await;
        self.downloads.shutdown().await;
        self.directory.disconnect().await;
        log_info!("Peer '{}' left the network", self.identity.username);
        Ok(cleanup?)
    }
}
