use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Router,
};
use peershare_balancer::{Balancer, UNAVAILABLE_MESSAGE};
use peershare_core::core::config::BalancerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Semaphore};

/// Fake index replica: echoes requests, answers pings per `up`, and parks
/// `/hold` requests until the gate opens.
struct FakeBackend {
    name: &'static str,
    up: AtomicBool,
    hits: AtomicUsize,
    gate: Semaphore,
}

async fn fake_handler(State(backend): State<Arc<FakeBackend>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    if path.ends_with("/admin/ping") {
        return if backend.up.load(Ordering::SeqCst) {
            (StatusCode::OK, r#"{"status":"OK"}"#).into_response()
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "down").into_response()
        };
    }

    backend.hits.fetch_add(1, Ordering::SeqCst);
    if path.ends_with("/hold") {
        if let Ok(permit) = backend.gate.acquire().await {
            permit.forget();
        }
    }

    let method = request.method().clone();
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_default();
    let host = request
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body: Bytes = axum::body::to_bytes(request.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    (
        StatusCode::OK,
        [("x-backend", backend.name.to_string()), ("x-seen-host", host)],
        format!("{} {} {}", method, target, String::from_utf8_lossy(&body)),
    )
        .into_response()
}

async fn spawn_backend(name: &'static str) -> (Arc<FakeBackend>, String) {
    let backend = Arc::new(FakeBackend {
        name,
        up: AtomicBool::new(true),
        hits: AtomicUsize::new(0),
        gate: Semaphore::new(0),
    });
    let app = Router::new()
        .fallback(fake_handler)
        .with_state(backend.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (backend, format!("http://{}/solr/core/", addr))
}

fn config(backends: Vec<String>) -> BalancerConfig {
    BalancerConfig {
        backends,
        health_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(500),
        request_timeout: Duration::from_secs(5),
        ..BalancerConfig::default()
    }
}

/// Serve only the relay router, without background health checks.
async fn spawn_router(balancer: &Balancer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = balancer.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn closed_port_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/solr/core/", addr)
}

#[tokio::test]
async fn test_forwards_and_relays_response() {
    let (backend, url) = spawn_backend("a").await;
    let balancer = Balancer::new(&config(vec![url])).unwrap();
    let pool = balancer.pool().clone();
    let addr = spawn_router(&balancer).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/select?q=name:song&wt=json", addr))
        .body("payload")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-backend"], "a");
    let seen_host = response.headers()["x-seen-host"].to_str().unwrap().to_string();
    assert_ne!(seen_host, addr.to_string());
    let body = response.text().await.unwrap();
    assert_eq!(body, "POST /solr/core/select?q=name:song&wt=json payload");
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);

    assert!(wait_until(|| pool.backends()[0].in_flight() == 0).await);
}

#[tokio::test]
async fn test_all_unhealthy_returns_503_without_contacting_backends() {
    let (first, url_a) = spawn_backend("a").await;
    let (second, url_b) = spawn_backend("b").await;
    let balancer = Balancer::new(&config(vec![url_a, url_b])).unwrap();
    balancer.pool().record_probe(0, false);
    balancer.pool().record_probe(1, false);
    let addr = spawn_router(&balancer).await;

    let response = reqwest::get(format!("http://{}/select?q=*:*", addr)).await.unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.text().await.unwrap(), UNAVAILABLE_MESSAGE);

    assert_eq!(first.hits.load(Ordering::SeqCst), 0);
    assert_eq!(second.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_busy_backend_is_skipped() {
    let (first, url_a) = spawn_backend("a").await;
    let (_second, url_b) = spawn_backend("b").await;
    let balancer = Balancer::new(&config(vec![url_a, url_b])).unwrap();
    let pool = balancer.pool().clone();
    let addr = spawn_router(&balancer).await;
    let client = reqwest::Client::new();

    let held = {
        let client = client.clone();
        tokio::spawn(async move {
            client.get(format!("http://{}/hold", addr)).send().await.unwrap()
        })
    };
    assert!(wait_until(|| pool.backends()[0].in_flight() == 1).await);

    let response = client.get(format!("http://{}/select", addr)).send().await.unwrap();
    assert_eq!(response.headers()["x-backend"], "b");

    first.gate.add_permits(1);
    let held = held.await.unwrap();
    assert_eq!(held.headers()["x-backend"], "a");
    assert_eq!(held.text().await.unwrap(), "GET /solr/core/hold ");
    assert!(wait_until(|| pool.backends().iter().all(|b| b.in_flight() == 0)).await);
}

#[tokio::test]
async fn test_unreachable_backend_returns_500() {
    let balancer = Balancer::new(&config(vec![closed_port_url()])).unwrap();
    let pool = balancer.pool().clone();
    let addr = spawn_router(&balancer).await;

    let response = reqwest::get(format!("http://{}/select", addr)).await.unwrap();
    assert_eq!(response.status(), 500);
    assert!(response.text().await.unwrap().starts_with("Internal server error:"));
    assert_eq!(pool.backends()[0].in_flight(), 0);
}

#[tokio::test]
async fn test_probe_round_flips_health() {
    let (backend, url) = spawn_backend("a").await;
    let balancer = Balancer::new(&config(vec![url, closed_port_url()])).unwrap();
    let pool = balancer.pool().clone();

    balancer.health().probe_all().await;
    assert!(pool.backends()[0].is_healthy());
    assert!(!pool.backends()[1].is_healthy());

    backend.up.store(false, Ordering::SeqCst);
    balancer.health().probe_all().await;
    assert!(!pool.backends()[0].is_healthy());

    backend.up.store(true, Ordering::SeqCst);
    balancer.health().probe_all().await;
    assert!(pool.backends()[0].is_healthy());
    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_backend_leaves_rotation_within_an_interval() {
    let (first, url_a) = spawn_backend("a").await;
    let (_second, url_b) = spawn_backend("b").await;
    let balancer = Balancer::new(&config(vec![url_a, url_b])).unwrap();
    let pool = balancer.pool().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(balancer.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    first.up.store(false, Ordering::SeqCst);
    assert!(wait_until(|| !pool.backends()[0].is_healthy()).await);

    let response = reqwest::get(format!("http://{}/select", addr)).await.unwrap();
    assert_eq!(response.headers()["x-backend"], "b");
    assert_eq!(first.hits.load(Ordering::SeqCst), 0);

    first.up.store(true, Ordering::SeqCst);
    assert!(wait_until(|| pool.backends()[0].is_healthy()).await);

    let _ = stop_tx.send(());
    server.await.unwrap().unwrap();
}

#[test]
fn test_zero_health_interval_is_rejected_before_serving() {
    let mut config = peershare_core::Config::default();
    config.balancer.health_interval = Duration::ZERO;
    assert!(config.validate().is_err());
    assert!(Balancer::new(&config.balancer).is_err());
}
