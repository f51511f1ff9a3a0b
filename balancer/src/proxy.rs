//! Request relay: pick a backend, forward, stream the answer back.

use crate::pool::BackendPool;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use peershare_core::system::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::Semaphore;
use peershare_core::{log_debug, log_error};

/// Body returned when every backend is unhealthy
pub const UNAVAILABLE_MESSAGE: &str = "All index servers are currently unavailable";

/// Shared state of the relay handler
pub struct ProxyState {
    pub(crate) pool: Arc<BackendPool>,
    pub(crate) client: reqwest::Client,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) max_body_bytes: usize,
}

impl ProxyState {
    /// State relaying at most `max_concurrent` requests at once.
    pub fn new(
        pool: Arc<BackendPool>,
        client: reqwest::Client,
        max_concurrent: usize,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            pool,
            client,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_body_bytes,
        }
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn upstream_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if name == header::HOST || name == header::CONTENT_LENGTH || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Target URL for a request path on the given backend base.
pub fn upstream_url(base: &str, path_and_query: &str) -> String {
    format!("{}{}", base, path_and_query.trim_start_matches('/'))
}

fn failure(message: impl std::fmt::Display) -> Response {
    Metrics::global().balancer.requests_failed.inc();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Internal server error: {}", message),
    )
        .into_response()
}

/// Fallback handler relaying every request to the least-loaded healthy backend.
pub async fn forward(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let permit = match state.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return failure("balancer is shutting down"),
    };

    let Some(guard) = state.pool.acquire() else {
        Metrics::global().balancer.requests_unavailable.inc();
        return (StatusCode::SERVICE_UNAVAILABLE, UNAVAILABLE_MESSAGE).into_response();
    };

    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = upstream_url(guard.backend().url(), path);

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log_error!("Failed to read request body for {}: {}", url, e);
            return failure(e);
        }
    };

    log_debug!("{} {} -> {}", parts.method, path, url);
    let upstream = state
        .client
        .request(parts.method.clone(), &url)
        .headers(upstream_headers(&parts.headers))
        .body(body)
        .send()
        .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            log_error!("Relay to {} failed: {}", url, e);
            return failure(e);
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }

    // The slot and the permit stay held until the body has been relayed.
    let stream = upstream.bytes_stream().map(move |chunk| {
        let _held = (&guard, &permit);
        chunk
    });

    match builder.body(Body::from_stream(stream)) {
        Ok(response) => {
            Metrics::global().balancer.requests_forwarded.inc();
            response
        }
        Err(e) => failure(e),
    }
}
