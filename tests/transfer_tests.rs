use peershare::transfer::protocol::{self, INVALID_FILENAME, NOT_FOUND};
use peershare::transfer::{DownloadRequest, TransferClient, TransferError, TransferEvent, TransferServer};
use peershare_core::core::TransferConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn transfer_config() -> TransferConfig {
    TransferConfig {
        read_timeout: Duration::from_secs(2),
        stall_timeout: Duration::from_millis(300),
        retry_backoff: Duration::from_millis(50),
        progress_interval: Duration::from_millis(5),
        server_shutdown_grace: Duration::from_secs(5),
        client_shutdown_grace: Duration::from_secs(1),
        ..TransferConfig::default()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn loopback(server: &TransferServer) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], server.local_addr().port()))
}

async fn publish(dir: &Path, name: &str, contents: &[u8]) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(path, contents).await.unwrap();
}

fn request(peer: SocketAddr, filename: &str, destination: &Path) -> DownloadRequest {
    DownloadRequest {
        peer,
        filename: filename.to_string(),
        destination: destination.to_path_buf(),
        expected_size: None,
    }
}

#[tokio::test]
async fn test_download_matches_published_file() {
    let shared = TempDir::new().unwrap();
    let downloads = TempDir::new().unwrap();
    let contents = payload(200_000);
    publish(shared.path(), "album/track01.mp3", &contents).await;

    let config = transfer_config();
    let server = TransferServer::start(&config, 0, shared.path()).await.unwrap();
    let client = TransferClient::new(&config);

    let destination = downloads.path().join("nested/track01.mp3");
    let mut handle = client.download(DownloadRequest {
        expected_size: Some(contents.len() as u64),
        ..request(loopback(&server), "album/track01.mp3", &destination)
    });

    let mut starts = 0;
    let mut last_progress = 0;
    let outcome = loop {
        match handle.next_event().await.expect("terminal event") {
            TransferEvent::Started { .. } => starts += 1,
            TransferEvent::Progress { received, total } => {
                assert!(received >= last_progress);
                assert_eq!(total, contents.len() as u64);
                last_progress = received;
            }
            TransferEvent::Retrying { error, .. } => panic!("unexpected retry: {}", error),
            TransferEvent::Finished(result) => break result.unwrap(),
        }
    };

    assert_eq!(starts, 1);
    assert_eq!(last_progress, contents.len() as u64);
    assert_eq!(outcome.bytes, contents.len() as u64);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), contents);

    server.stop().await;
}

#[tokio::test]
async fn test_empty_file_downloads() {
    let shared = TempDir::new().unwrap();
    let downloads = TempDir::new().unwrap();
    publish(shared.path(), "empty.txt", b"").await;

    let config = transfer_config();
    let server = TransferServer::start(&config, 0, shared.path()).await.unwrap();
    let client = TransferClient::new(&config);

    let destination = downloads.path().join("empty.txt");
    let outcome = client
        .download(request(loopback(&server), "empty.txt", &destination))
        .wait()
        .await
        .unwrap();
    assert_eq!(outcome.bytes, 0);
    assert!(destination.exists());
    server.stop().await;
}

#[tokio::test]
async fn test_traversal_is_rejected_on_the_wire() {
    let root = TempDir::new().unwrap();
    let shared = root.path().join("shared");
    tokio::fs::create_dir_all(&shared).await.unwrap();
    tokio::fs::write(root.path().join("secret.txt"), b"top secret").await.unwrap();

    let server = TransferServer::start(&transfer_config(), 0, &shared).await.unwrap();

    for name in ["../secret.txt", "..\\secret.txt", "a/../../secret.txt"] {
        let mut stream = TcpStream::connect(loopback(&server)).await.unwrap();
        protocol::write_frame(&mut stream, name).await.unwrap();
        let frame = protocol::read_frame(&mut stream).await.unwrap();
        assert_eq!(frame, format!("ERROR: {}", INVALID_FILENAME), "name {:?}", name);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    server.stop().await;
}

#[tokio::test]
async fn test_missing_file_fails_without_retry() {
    let shared = TempDir::new().unwrap();
    let downloads = TempDir::new().unwrap();
    let config = transfer_config();
    let server = TransferServer::start(&config, 0, shared.path()).await.unwrap();
    let client = TransferClient::new(&config);

    let destination = downloads.path().join("nope.txt");
    let mut handle = client.download(request(loopback(&server), "nope.txt", &destination));

    let mut starts = 0;
    let result = loop {
        match handle.next_event().await.expect("terminal event") {
            TransferEvent::Started { .. } => starts += 1,
            TransferEvent::Finished(result) => break result,
            _ => {}
        }
    };

    assert_eq!(starts, 1);
    match result {
        Err(TransferError::Rejected(reason)) => assert_eq!(reason, NOT_FOUND),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(!destination.exists());
    server.stop().await;
}

/// Peer that announces `size` bytes, sends half, then goes silent.
async fn stalling_peer(size: u64) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let _ = protocol::read_frame(&mut stream).await;
                protocol::write_frame(&mut stream, protocol::RESPONSE_OK).await.unwrap();
                protocol::write_size(&mut stream, size).await.unwrap();
                stream.write_all(&vec![7u8; (size / 2) as usize]).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
            });
        }
    });

    (addr, connections)
}

#[tokio::test]
async fn test_stalled_peer_retries_then_discards_partial() {
    let downloads = TempDir::new().unwrap();
    let (addr, connections) = stalling_peer(1000).await;

    let config = TransferConfig { max_retries: 2, ..transfer_config() };
    let client = TransferClient::new(&config);
    let destination = downloads.path().join("half.bin");

    let mut handle = client.download(request(addr, "half.bin", &destination));
    let mut retries = Vec::new();
    let result = loop {
        match handle.next_event().await.expect("terminal event") {
            TransferEvent::Retrying { attempt, error } => {
                assert!(error.is_transient());
                retries.push(attempt);
            }
            TransferEvent::Finished(result) => break result,
            _ => {}
        }
    };

    assert_eq!(retries, vec![1, 2]);
    assert!(matches!(result, Err(TransferError::Stalled { received: 500, expected: 1000 })));
    assert_eq!(connections.load(Ordering::SeqCst), 3);
    assert!(!destination.exists());
    assert_eq!(client.active_downloads(), 0);
}

/// Peer that sends `chunks` pieces of `chunk` bytes, one every `every`.
async fn trickling_peer(chunks: usize, chunk: usize, every: Duration) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else { return };
        let _ = protocol::read_frame(&mut stream).await;
        protocol::write_frame(&mut stream, protocol::RESPONSE_OK).await.unwrap();
        protocol::write_size(&mut stream, (chunks * chunk) as u64).await.unwrap();
        for _ in 0..chunks {
            stream.write_all(&vec![3u8; chunk]).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(every).await;
        }
    });
    addr
}

#[tokio::test]
async fn test_progress_events_are_throttled() {
    let downloads = TempDir::new().unwrap();
    let interval = Duration::from_millis(80);
    let config = TransferConfig {
        progress_interval: interval,
        ..transfer_config()
    };
    let peer = trickling_peer(20, 50, Duration::from_millis(10)).await;
    let client = TransferClient::new(&config);

    let started = std::time::Instant::now();
    let mut handle = client.download(request(peer, "slow.bin", &downloads.path().join("slow.bin")));
    let mut progress = Vec::new();
    loop {
        match handle.next_event().await.expect("terminal event") {
            TransferEvent::Progress { received, total } => {
                assert_eq!(total, 1000);
                progress.push(received);
            }
            TransferEvent::Finished(result) => {
                assert_eq!(result.unwrap().bytes, 1000);
                break;
            }
            _ => {}
        }
    }
    let elapsed = started.elapsed();

    // Every event but the final one waited a full interval since the last.
    let throttled = progress.len() as u128 - 1;
    assert!(throttled * interval.as_millis() <= elapsed.as_millis(), "{:?} in {:?}", progress, elapsed);
    assert!(progress.len() < 20, "{:?}", progress);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(progress.last(), Some(&1000));

    client.shutdown().await;
}

#[tokio::test]
async fn test_server_workers_bound_concurrent_transfers() {
    let shared = TempDir::new().unwrap();
    let big = payload(32 * 1024 * 1024);
    publish(shared.path(), "big.bin", &big).await;
    publish(shared.path(), "small.txt", b"hello").await;

    let config = TransferConfig {
        server_workers: 1,
        ..transfer_config()
    };
    let server = TransferServer::start(&config, 0, shared.path()).await.unwrap();

    // Hold the only worker by reading the big file slowly.
    let mut first = TcpStream::connect(loopback(&server)).await.unwrap();
    protocol::write_frame(&mut first, "big.bin").await.unwrap();
    assert_eq!(protocol::read_frame(&mut first).await.unwrap(), protocol::RESPONSE_OK);
    assert_eq!(protocol::read_size(&mut first).await.unwrap(), big.len() as u64);
    let mut head = vec![0u8; 8192];
    first.read_exact(&mut head).await.unwrap();

    // The second connection is accepted but queued behind the first.
    let mut second = TcpStream::connect(loopback(&server)).await.unwrap();
    protocol::write_frame(&mut second, "small.txt").await.unwrap();
    let queued = tokio::time::timeout(Duration::from_millis(300), protocol::read_frame(&mut second)).await;
    assert!(queued.is_err(), "second transfer started while the worker was busy");

    let mut rest = Vec::new();
    first.read_to_end(&mut rest).await.unwrap();
    assert_eq!(head.len() + rest.len(), big.len());

    assert_eq!(protocol::read_frame(&mut second).await.unwrap(), protocol::RESPONSE_OK);
    assert_eq!(protocol::read_size(&mut second).await.unwrap(), 5);
    let mut body = Vec::new();
    second.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"hello");

    server.stop().await;
}

#[tokio::test]
async fn test_stop_lets_running_transfer_finish() {
    let shared = TempDir::new().unwrap();
    let contents = payload(8 * 1024 * 1024);
    publish(shared.path(), "big.bin", &contents).await;

    let server = TransferServer::start(&transfer_config(), 0, shared.path()).await.unwrap();
    let addr = loopback(&server);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    protocol::write_frame(&mut stream, "big.bin").await.unwrap();
    assert_eq!(protocol::read_frame(&mut stream).await.unwrap(), protocol::RESPONSE_OK);
    let size = protocol::read_size(&mut stream).await.unwrap();
    assert_eq!(size, contents.len() as u64);

    let reader = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut received = Vec::with_capacity(size as usize);
        stream.read_to_end(&mut received).await.unwrap();
        received
    };
    let (aborted, received) = tokio::join!(server.stop(), reader);

    assert_eq!(aborted, 0);
    assert_eq!(received, contents);
    assert!(!server.is_accepting());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_not_accepting_closes_new_connections() {
    let shared = TempDir::new().unwrap();
    publish(shared.path(), "a.txt", b"abc").await;
    let server = TransferServer::start(&transfer_config(), 0, shared.path()).await.unwrap();
    server.stop_accepting();

    let mut stream = TcpStream::connect(loopback(&server)).await.unwrap();
    let _ = protocol::write_frame(&mut stream, "a.txt").await;
    assert!(protocol::read_frame(&mut stream).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_cancels_queued_downloads() {
    let downloads = TempDir::new().unwrap();
    let (addr, _) = stalling_peer(1000).await;
    let config = TransferConfig {
        download_workers: 1,
        max_retries: 0,
        stall_timeout: Duration::from_secs(30),
        read_timeout: Duration::from_secs(30),
        client_shutdown_grace: Duration::from_millis(100),
        ..transfer_config()
    };
    let client = TransferClient::new(&config);

    let running = client.download(request(addr, "a.bin", &downloads.path().join("a.bin")));
    let queued = client.download(request(addr, "b.bin", &downloads.path().join("b.bin")));
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.shutdown().await;
    assert!(matches!(queued.wait().await, Err(TransferError::Cancelled)));
    assert!(matches!(running.wait().await, Err(TransferError::Cancelled)));
    assert!(!downloads.path().join("a.bin").exists());
}
