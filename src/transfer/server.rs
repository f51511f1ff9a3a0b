//! Transfer server: serves files out of a sandboxed publish directory.

use crate::transfer::protocol::{self, Response, INVALID_FILENAME, NOT_FOUND};
use peershare_core::core::TransferConfig;
use peershare_core::system::Metrics;
use peershare_core::{log_debug, log_info, log_warn};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

const PROGRESS_LOG_BYTES: u64 = 5 * 1024 * 1024;

/// Per-connection settings, shared read-only by every handler.
struct ServeContext {
    publish_dir: PathBuf,
    chunk_size: usize,
    request_timeout: Duration,
}

/// A running transfer server.
///
/// Connections beyond `server_workers` are accepted and wait for a free
/// worker permit.
pub struct TransferServer {
    local_addr: SocketAddr,
    publish_dir: PathBuf,
    accepting: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    connections: Arc<parking_lot::Mutex<JoinSet<()>>>,
    stop_tx: watch::Sender<bool>,
    accept_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl TransferServer {
    /// Bind `port` on all interfaces and start serving `publish_dir`.
    ///
    /// Port 0 binds an ephemeral port; see [`TransferServer::local_addr`].
    pub async fn start(config: &TransferConfig, port: u16, publish_dir: impl AsRef<Path>) -> io::Result<Self> {
        let publish_dir = tokio::fs::canonicalize(publish_dir.as_ref()).await?;
        if !tokio::fs::metadata(&publish_dir).await?.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("publish path {} is not a directory", publish_dir.display()),
            ));
        }

        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let local_addr = listener.local_addr()?;

        let accepting = Arc::new(AtomicBool::new(true));
        let permits = Arc::new(Semaphore::new(config.server_workers));
        let connections = Arc::new(parking_lot::Mutex::new(JoinSet::new()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = Arc::new(ServeContext {
            publish_dir: publish_dir.clone(),
            chunk_size: config.chunk_size,
            request_timeout: config.read_timeout,
        });

        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            accepting.clone(),
            permits.clone(),
            connections.clone(),
            stop_rx,
        ));

        log_info!(
            "Transfer server listening on {} serving {} ({} workers)",
            local_addr,
            publish_dir.display(),
            config.server_workers
        );

        Ok(Self {
            local_addr,
            publish_dir,
            accepting,
            permits,
            connections,
            stop_tx,
            accept_task: parking_lot::Mutex::new(Some(accept_task)),
            grace: config.server_shutdown_grace,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Canonical publish directory being served
    pub fn publish_dir(&self) -> &Path {
        &self.publish_dir
    }

    /// Whether new connections are being served
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Keep the listener open but close every new socket immediately.
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::SeqCst) {
            log_info!("Transfer server on {} stopped accepting connections", self.local_addr);
        }
    }

    /// Two-phase shutdown: stop accepting, then give accepted connections
    /// the grace period to finish before aborting them.
    ///
    /// Returns how many connections were aborted.
    pub async fn stop(&self) -> usize {
        self.stop_accepting();
        let _ = self.stop_tx.send(true);
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        let mut connections = std::mem::take(&mut *self.connections.lock());
        let drained = tokio::time::timeout(self.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        let aborted = connections.len();
        if drained.is_err() {
            log_warn!(
                "Transfer server grace period of {:?} elapsed, aborting {} connection(s)",
                self.grace,
                aborted
            );
            self.permits.close();
            connections.shutdown().await;
        }
        log_info!("Transfer server on {} stopped", self.local_addr);
        aborted
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServeContext>,
    accepting: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    connections: Arc<parking_lot::Mutex<JoinSet<()>>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        log_warn!("Transfer server accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if !accepting.load(Ordering::SeqCst) {
                    log_debug!("Rejecting connection from {} while not accepting", peer);
                    drop(stream);
                    continue;
                }

                let ctx = ctx.clone();
                let permits = permits.clone();
                let mut set = connections.lock();
                while set.try_join_next().is_some() {}
                set.spawn(async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    if let Err(e) = handle_connection(stream, peer, &ctx).await {
                        log_warn!("Transfer to {} failed: {}", peer, e);
                    }
                });
            }
        }
    }
    log_debug!("Transfer accept loop exited");
}

/// Serve one request. Errors only affect this connection.
async fn handle_connection(mut stream: TcpStream, peer: SocketAddr, ctx: &ServeContext) -> io::Result<()> {
    let requested = tokio::time::timeout(ctx.request_timeout, protocol::read_frame(&mut stream))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no request received"))??;
    log_debug!("Peer {} requested '{}'", peer, requested);

    let (mut file, size) = match open_requested(&ctx.publish_dir, &requested).await {
        Ok(found) => found,
        Err(reason) => {
            log_info!("Rejecting request from {} for '{}': {}", peer, requested, reason);
            Metrics::global().transfer.uploads_rejected.inc();
            protocol::write_frame(&mut stream, &Response::Error(reason.to_string()).encode()).await?;
            return Ok(());
        }
    };

    protocol::write_frame(&mut stream, &Response::Ok.encode()).await?;
    protocol::write_size(&mut stream, size).await?;

    let mut buf = vec![0u8; ctx.chunk_size];
    let mut sent: u64 = 0;
    let mut next_log = PROGRESS_LOG_BYTES;
    while sent < size {
        let want = buf.len().min((size - sent) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            // File shrank after the size was announced; the peer sees a short read.
            log_warn!("'{}' ended after {} of {} bytes", requested, sent, size);
            break;
        }
        stream.write_all(&buf[..n]).await?;
        sent += n as u64;
        Metrics::global().transfer.bytes_served.inc_by(n as u64);
        if sent >= next_log {
            log_debug!("Sent {} of {} bytes of '{}' to {}", sent, size, requested, peer);
            next_log += PROGRESS_LOG_BYTES;
        }
    }
    stream.flush().await?;
    stream.shutdown().await?;

    if sent == size {
        Metrics::global().transfer.uploads_completed.inc();
        log_info!("Served '{}' ({} bytes) to {}", requested, size, peer);
    }
    Ok(())
}

/// Resolve `requested` inside `publish_dir` and open it.
///
/// `publish_dir` must already be canonical. The error is the reason sent
/// back to the peer.
async fn open_requested(publish_dir: &Path, requested: &str) -> Result<(File, u64), &'static str> {
    if !protocol::is_valid_filename(requested) {
        return Err(INVALID_FILENAME);
    }

    let candidate = publish_dir.join(requested);
    if !candidate.starts_with(publish_dir) {
        return Err(INVALID_FILENAME);
    }

    // Symlinks may still point outside; compare the resolved path too.
    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(_) => return Err(NOT_FOUND),
    };
    if !resolved.starts_with(publish_dir) {
        return Err(INVALID_FILENAME);
    }

    let metadata = match tokio::fs::metadata(&resolved).await {
        Ok(meta) if meta.is_file() => meta,
        _ => return Err(NOT_FOUND),
    };
    let file = File::open(&resolved).await.map_err(|_| NOT_FOUND)?;
    Ok((file, metadata.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_requested_outcomes() {
        let root = tempfile::tempdir().unwrap();
        let publish = root.path().join("publish");
        std::fs::create_dir(&publish).unwrap();
        std::fs::write(publish.join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(publish.join("sub")).unwrap();
        std::fs::write(root.path().join("secret.txt"), b"nope").unwrap();
        let publish = std::fs::canonicalize(&publish).unwrap();

        let (_, size) = open_requested(&publish, "a.txt").await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(open_requested(&publish, "../secret.txt").await.unwrap_err(), INVALID_FILENAME);
        assert_eq!(open_requested(&publish, "missing.txt").await.unwrap_err(), NOT_FOUND);
        assert_eq!(open_requested(&publish, "sub").await.unwrap_err(), NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        let publish = root.path().join("publish");
        std::fs::create_dir(&publish).unwrap();
        std::fs::write(root.path().join("secret.txt"), b"nope").unwrap();
        std::os::unix::fs::symlink(root.path().join("secret.txt"), publish.join("link.txt")).unwrap();
        let publish = std::fs::canonicalize(&publish).unwrap();

        assert_eq!(open_requested(&publish, "link.txt").await.unwrap_err(), INVALID_FILENAME);
    }
}
