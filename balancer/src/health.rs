//! Periodic liveness probing of the backend pool.

use crate::pool::{BackendPool, HealthTransition};
use futures_util::future::join_all;
use peershare_core::system::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use peershare_core::{log_debug, log_info, log_warn};

/// Probes every backend on a fixed interval and flips its health flag.
#[derive(Clone)]
pub struct HealthChecker {
    pool: Arc<BackendPool>,
    client: reqwest::Client,
    health_path: String,
    interval: Duration,
    timeout: Duration,
}

impl HealthChecker {
    /// Checker over `pool` probing `{backend}{health_path}`.
    pub fn new(
        pool: Arc<BackendPool>,
        client: reqwest::Client,
        health_path: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            pool,
            client,
            health_path: health_path.trim_start_matches('/').to_string(),
            interval,
            timeout,
        }
    }

    /// Run one probe round over all backends concurrently.
    pub async fn probe_all(&self) {
        let probes = self
            .pool
            .backends()
            .iter()
            .map(|backend| self.probe(backend.url()));
        let results = join_all(probes).await;

        let gauge = &Metrics::global().balancer.backend_up;
        for (index, healthy) in results.into_iter().enumerate() {
            let url = self.pool.backends()[index].url();
            gauge.with_label_values(&[url]).set(i64::from(healthy));
            match self.pool.record_probe(index, healthy) {
                Some(HealthTransition::WentDown) => log_warn!("Backend {} is DOWN", url),
                Some(HealthTransition::CameUp) => log_info!("Backend {} is UP", url),
                None => {}
            }
        }
    }

    async fn probe(&self, base: &str) -> bool {
        let url = format!("{}{}", base, self.health_path);
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                if !ok {
                    log_debug!("Health probe {} answered {}", url, response.status());
                }
                ok
            }
            Err(e) => {
                log_debug!("Health probe {} failed: {}", url, e);
                false
            }
        }
    }

    /// Probe immediately, then once per interval until `shutdown` fires.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.probe_all().await,
                    _ = shutdown.changed() => break,
                }
            }
            log_debug!("Health checker stopped");
        })
    }
}
