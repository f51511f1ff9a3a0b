//! Transfer client: downloads files from remote peers.
//!
//! Downloads run on a bounded pool. Each one reports through a
//! [`DownloadHandle`]: a stream of [`TransferEvent`]s ending in exactly one
//! [`TransferEvent::Finished`].

use crate::transfer::error::TransferError;
use crate::transfer::protocol::{self, Response};
use dashmap::DashMap;
use peershare_core::core::TransferConfig;
use peershare_core::system::Metrics;
use peershare_core::{log_debug, log_info, log_warn, FileRecord};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

/// One file to fetch from one peer.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Transfer server address of the owner
    pub peer: SocketAddr,
    /// Name as published by the owner
    pub filename: String,
    /// Local path the file is written to
    pub destination: PathBuf,
    /// Size advertised by the directory, if known
    pub expected_size: Option<u64>,
}

impl DownloadRequest {
    /// Build a request for a search hit, `None` when the owner address is unknown.
    pub fn for_record(record: &FileRecord, destination: impl Into<PathBuf>) -> Option<Self> {
        Some(Self {
            peer: record.owner_addr?,
            filename: record.filename.clone(),
            destination: destination.into(),
            expected_size: Some(record.size),
        })
    }
}

/// Successful download summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Where the file was written
    pub path: PathBuf,
    /// Bytes written
    pub bytes: u64,
    /// Attempts used, starting at 1
    pub attempts: u32,
}

/// Progress report for one download.
#[derive(Debug)]
pub enum TransferEvent {
    /// An attempt is connecting
    Started {
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// Bytes received so far
    Progress {
        /// Bytes written to disk
        received: u64,
        /// Size announced by the peer
        total: u64,
    },
    /// A transient failure; another attempt follows after the back-off
    Retrying {
        /// Attempt that failed
        attempt: u32,
        /// Why it failed
        error: TransferError,
    },
    /// Terminal event
    Finished(Result<TransferOutcome, TransferError>),
}

/// Receiving side of a queued download.
#[derive(Debug)]
pub struct DownloadHandle {
    id: Uuid,
    events: mpsc::UnboundedReceiver<TransferEvent>,
}

impl DownloadHandle {
    /// Transfer id, also used in logs
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, `None` once the terminal event was consumed.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Drain events and return the terminal result.
    pub async fn wait(mut self) -> Result<TransferOutcome, TransferError> {
        while let Some(event) = self.events.recv().await {
            if let TransferEvent::Finished(result) = event {
                return result;
            }
        }
        // Sender dropped without a result: the task was aborted.
        Err(TransferError::Cancelled)
    }
}

#[derive(Debug, Clone)]
struct ClientSettings {
    chunk_size: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    stall_timeout: Duration,
    max_retries: u32,
    retry_backoff: Duration,
    progress_interval: Duration,
}

/// Bounded-concurrency download client.
pub struct TransferClient {
    settings: Arc<ClientSettings>,
    permits: Arc<Semaphore>,
    tasks: parking_lot::Mutex<JoinSet<()>>,
    partials: Arc<DashMap<Uuid, PathBuf>>,
    grace: Duration,
}

impl TransferClient {
    /// Create a client from the transfer settings.
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            settings: Arc::new(ClientSettings {
                chunk_size: config.chunk_size,
                connect_timeout: config.connect_timeout,
                read_timeout: config.read_timeout,
                stall_timeout: config.stall_timeout,
                max_retries: config.max_retries,
                retry_backoff: config.retry_backoff,
                progress_interval: config.progress_interval,
            }),
            permits: Arc::new(Semaphore::new(config.download_workers)),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
            partials: Arc::new(DashMap::new()),
            grace: config.client_shutdown_grace,
        }
    }

    /// Queue a download. It starts once a worker is free.
    pub fn download(&self, request: DownloadRequest) -> DownloadHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = self.settings.clone();
        let permits = self.permits.clone();
        let partials = self.partials.clone();

        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => run_download(id, &request, &settings, &tx, &partials).await,
                Err(_) => Err(TransferError::Cancelled),
            };
            match &result {
                Ok(outcome) => {
                    Metrics::global().transfer.downloads_completed.inc();
                    log_info!("[{}] Downloaded '{}' ({} bytes) from {}", id, request.filename, outcome.bytes, request.peer);
                }
                Err(e) => {
                    Metrics::global().transfer.downloads_failed.inc();
                    log_warn!("[{}] Download of '{}' from {} failed: {}", id, request.filename, request.peer, e);
                }
            }
            let _ = tx.send(TransferEvent::Finished(result));
        });

        DownloadHandle { id, events: rx }
    }

    /// Downloads currently writing to their destination
    pub fn active_downloads(&self) -> usize {
        self.partials.len()
    }

    /// Cancel queued downloads, wait up to the grace period for running
    /// ones, then abort the rest and delete their partial files.
    pub async fn shutdown(&self) {
        self.permits.close();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let drained = timeout(self.grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            log_warn!("Aborting {} download(s) after {:?} grace period", tasks.len(), self.grace);
            tasks.shutdown().await;
        }

        let leftovers: Vec<PathBuf> = self.partials.iter().map(|e| e.value().clone()).collect();
        self.partials.clear();
        for path in leftovers {
            discard_partial(&path).await;
        }
        log_info!("Transfer client shut down");
    }
}

/// Run attempts until success, a permanent failure, or the retry bound.
async fn run_download(
    id: Uuid,
    request: &DownloadRequest,
    settings: &ClientSettings,
    events: &mpsc::UnboundedSender<TransferEvent>,
    partials: &DashMap<Uuid, PathBuf>,
) -> Result<TransferOutcome, TransferError> {
    if let Some(parent) = request.destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::local(parent, e))?;
        }
    }

    let max_attempts = settings.max_retries + 1;
    let mut attempt = 1;
    let mut touched = false;
    loop {
        let _ = events.send(TransferEvent::Started { attempt });
        log_debug!("[{}] Attempt {}/{} for '{}' from {}", id, attempt, max_attempts, request.filename, request.peer);

        let result = attempt_download(request, settings, events, || {
            touched = true;
            partials.insert(id, request.destination.clone());
        })
        .await;

        match result {
            Ok(bytes) => {
                partials.remove(&id);
                return Ok(TransferOutcome {
                    path: request.destination.clone(),
                    bytes,
                    attempts: attempt,
                });
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                log_warn!("[{}] Attempt {} failed: {}. Retrying in {:?}", id, attempt, error, settings.retry_backoff);
                Metrics::global().transfer.download_retries.inc();
                let _ = events.send(TransferEvent::Retrying { attempt, error });
                tokio::time::sleep(settings.retry_backoff).await;
                attempt += 1;
            }
            Err(error) => {
                if touched {
                    discard_partial(&request.destination).await;
                }
                partials.remove(&id);
                return Err(error);
            }
        }
    }
}

/// One connection: request, header, payload. Returns bytes written.
async fn attempt_download(
    request: &DownloadRequest,
    settings: &ClientSettings,
    events: &mpsc::UnboundedSender<TransferEvent>,
    on_create: impl FnOnce(),
) -> Result<u64, TransferError> {
    let mut stream = timeout(settings.connect_timeout, TcpStream::connect(request.peer))
        .await
        .map_err(|_| TransferError::TimedOut)?
        .map_err(TransferError::network)?;

    protocol::write_frame(&mut stream, &request.filename)
        .await
        .map_err(TransferError::network)?;

    let frame = timeout(settings.read_timeout, protocol::read_frame(&mut stream))
        .await
        .map_err(|_| TransferError::TimedOut)?
        .map_err(TransferError::network)?;
    match Response::parse(&frame) {
        Some(Response::Ok) => {}
        Some(Response::Error(reason)) => return Err(TransferError::Rejected(reason)),
        None => return Err(TransferError::Protocol(format!("unexpected response '{}'", frame))),
    }

    let total = timeout(settings.read_timeout, protocol::read_size(&mut stream))
        .await
        .map_err(|_| TransferError::TimedOut)?
        .map_err(TransferError::network)?;
    if let Some(expected) = request.expected_size {
        if expected != total {
            log_warn!("'{}' is {} bytes, directory advertised {}", request.filename, total, expected);
        }
    }

    let mut file = File::create(&request.destination)
        .await
        .map_err(|e| TransferError::local(&request.destination, e))?;
    on_create();

    let mut buf = vec![0u8; settings.chunk_size];
    let mut received: u64 = 0;
    let mut last_byte_at = Instant::now();
    let mut last_report_at = Instant::now();
    while received < total {
        let want = buf.len().min((total - received) as usize);
        let stall_left = settings.stall_timeout.saturating_sub(last_byte_at.elapsed());
        let wait = settings.read_timeout.min(stall_left);

        let n = match timeout(wait, stream.read(&mut buf[..want])).await {
            Err(_) if last_byte_at.elapsed() >= settings.stall_timeout => {
                return Err(TransferError::Stalled { received, expected: total });
            }
            Err(_) => return Err(TransferError::TimedOut),
            Ok(Err(e)) => return Err(TransferError::network(e)),
            Ok(Ok(0)) => {
                return Err(TransferError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {} of {} bytes", received, total),
                )));
            }
            Ok(Ok(n)) => n,
        };

        file.write_all(&buf[..n])
            .await
            .map_err(|e| TransferError::local(&request.destination, e))?;
        received += n as u64;
        last_byte_at = Instant::now();
        Metrics::global().transfer.bytes_received.inc_by(n as u64);

        if last_report_at.elapsed() >= settings.progress_interval {
            let _ = events.send(TransferEvent::Progress { received, total });
            last_report_at = Instant::now();
        }
    }

    file.flush()
        .await
        .map_err(|e| TransferError::local(&request.destination, e))?;
    let _ = events.send(TransferEvent::Progress { received, total });
    Ok(received)
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log_debug!("Removed partial download {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log_warn!("Could not remove partial download {}: {}", path.display(), e),
    }
}
