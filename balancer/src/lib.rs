//! Health-checking reverse proxy for the directory index replicas.
//!
//! Requests are relayed to the healthy backend with the fewest requests in
//! flight. A background task probes every backend and takes failing ones
//! out of rotation until they answer again.

#![warn(missing_docs)]

/// Backend pool and selection
pub mod pool;

/// Periodic health probing
pub mod health;

/// Request relay handler
pub mod proxy;

use axum::{routing::get, Router};
use peershare_core::core::config::{BalancerConfig, MetricsConfig};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use peershare_core::{log_error, log_info};

pub use health::HealthChecker;
pub use pool::{Backend, BackendPool, HealthTransition, InFlightGuard};
pub use proxy::{ProxyState, UNAVAILABLE_MESSAGE};

/// Balancer errors
#[derive(thiserror::Error, Debug)]
pub enum BalancerError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP client construction failed
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    /// Listener failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A configured balancer, ready to serve.
pub struct Balancer {
    pool: Arc<BackendPool>,
    state: Arc<ProxyState>,
    health: HealthChecker,
}

impl Balancer {
    /// Build the pool and upstream client from configuration.
    pub fn new(config: &BalancerConfig) -> Result<Self, BalancerError> {
        if config.backends.is_empty() {
            return Err(BalancerError::Config("at least one backend is required".into()));
        }
        if config.max_concurrent == 0 {
            return Err(BalancerError::Config("max_concurrent must be at least 1".into()));
        }
        if config.health_interval.is_zero() || config.probe_timeout.is_zero() {
            return Err(BalancerError::Config(
                "health_interval and probe_timeout must be greater than zero".into(),
            ));
        }
        for backend in &config.backends {
            if !(backend.starts_with("http://") || backend.starts_with("https://")) {
                return Err(BalancerError::Config(format!(
                    "backend {} must be an http(s) URL",
                    backend
                )));
            }
        }

        let pool = Arc::new(BackendPool::new(&config.backends));
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        let health = HealthChecker::new(
            pool.clone(),
            client.clone(),
            &config.health_path,
            config.health_interval,
            config.probe_timeout,
        );
        let state = Arc::new(ProxyState::new(
            pool.clone(),
            client,
            config.max_concurrent,
            config.max_body_bytes,
        ));

        Ok(Self { pool, state, health })
    }

    /// Shared backend pool
    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Health checker bound to this pool
    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    /// Router relaying every path and method.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy::forward)
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state.clone())
    }

    /// Serve on `listener` with health checks running until `shutdown` resolves.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), BalancerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let health = self.health.clone().spawn(stop_rx);

        log_info!(
            "Balancer listening on http://{} with {} backends",
            listener.local_addr()?,
            self.pool.backends().len()
        );
        for backend in self.pool.backends() {
            log_info!("  backend {}", backend.url());
        }

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        let _ = stop_tx.send(true);
        if let Err(e) = health.await {
            log_error!("Health checker task failed: {}", e);
        }
        self.state.permits.close();

        result.map_err(BalancerError::from)
    }
}

/// Router exposing the Prometheus registry at `/metrics`.
pub fn metrics_router() -> Router {
    Router::new().route(
        "/metrics",
        get(|| async {
            match peershare_core::system::metrics::encode_text() {
                Ok(text) => (axum::http::StatusCode::OK, text),
                Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }),
    )
}

/// Serve [`metrics_router`] when Prometheus export is enabled.
pub async fn serve_metrics(config: &MetricsConfig) -> Result<(), BalancerError> {
    if !config.enable_prometheus {
        return Ok(());
    }
    let listener = TcpListener::bind(config.metrics_addr).await?;
    log_info!("Metrics available at http://{}/metrics", config.metrics_addr);
    axum::serve(listener, metrics_router()).await?;
    Ok(())
}
