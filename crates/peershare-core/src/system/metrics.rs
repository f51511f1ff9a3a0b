//! Metrics collection and monitoring
//!
//! Counters live in the default Prometheus registry so any binary can expose
//! them with [`encode_text`].

use crate::types::Result;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_gauge_vec, Encoder, IntCounter, IntGaugeVec, TextEncoder,
};

/// Peer-to-peer transfer metrics
pub struct TransferMetrics {
    /// Bytes streamed to other peers
    pub bytes_served: IntCounter,
    /// Bytes received from other peers
    pub bytes_received: IntCounter,
    /// Uploads that finished streaming
    pub uploads_completed: IntCounter,
    /// Requests rejected with an ERROR frame
    pub uploads_rejected: IntCounter,
    /// Downloads that completed
    pub downloads_completed: IntCounter,
    /// Downloads that failed after all retries
    pub downloads_failed: IntCounter,
    /// Download attempts retried after a transient failure
    pub download_retries: IntCounter,
}

/// Directory client metrics
pub struct DirectoryMetrics {
    /// Endpoint switches after a failure
    pub failovers: IntCounter,
    /// Logical operations that exhausted their attempts
    pub operations_failed: IntCounter,
}

/// Load balancer metrics
pub struct BalancerMetrics {
    /// Requests relayed to a backend
    pub requests_forwarded: IntCounter,
    /// Requests answered 503 because no backend was healthy
    pub requests_unavailable: IntCounter,
    /// Requests that failed while relaying
    pub requests_failed: IntCounter,
    /// 1 when the backend is considered healthy
    pub backend_up: IntGaugeVec,
}

/// Centralized metrics collection for all system components
pub struct Metrics {
    /// Transfer metrics
    pub transfer: TransferMetrics,
    /// Directory metrics
    pub directory: DirectoryMetrics,
    /// Balancer metrics
    pub balancer: BalancerMetrics,
}

impl Metrics {
    /// Create new metrics instance
    fn new() -> Result<Self> {
        Ok(Self {
            transfer: TransferMetrics {
                bytes_served: register_int_counter!(
                    "ps_transfer_bytes_served_total",
                    "Bytes streamed to other peers"
                )?,
                bytes_received: register_int_counter!(
                    "ps_transfer_bytes_received_total",
                    "Bytes received from other peers"
                )?,
                uploads_completed: register_int_counter!(
                    "ps_transfer_uploads_completed_total",
                    "Uploads that finished streaming"
                )?,
                uploads_rejected: register_int_counter!(
                    "ps_transfer_uploads_rejected_total",
                    "File requests rejected by the transfer server"
                )?,
                downloads_completed: register_int_counter!(
                    "ps_transfer_downloads_completed_total",
                    "Downloads that completed"
                )?,
                downloads_failed: register_int_counter!(
                    "ps_transfer_downloads_failed_total",
                    "Downloads that failed after all retries"
                )?,
                download_retries: register_int_counter!(
                    "ps_transfer_download_retries_total",
                    "Download attempts retried after a transient failure"
                )?,
            },
            directory: DirectoryMetrics {
                failovers: register_int_counter!(
                    "ps_directory_failovers_total",
                    "Index endpoint switches after a failure"
                )?,
                operations_failed: register_int_counter!(
                    "ps_directory_operations_failed_total",
                    "Directory operations that exhausted their attempts"
                )?,
            },
            balancer: BalancerMetrics {
                requests_forwarded: register_int_counter!(
                    "ps_balancer_requests_forwarded_total",
                    "Requests relayed to a backend"
                )?,
                requests_unavailable: register_int_counter!(
                    "ps_balancer_requests_unavailable_total",
                    "Requests rejected because no backend was healthy"
                )?,
                requests_failed: register_int_counter!(
                    "ps_balancer_requests_failed_total",
                    "Requests that failed while relaying"
                )?,
                backend_up: register_int_gauge_vec!(
                    "ps_balancer_backend_up",
                    "Backend health as seen by the balancer",
                    &["backend"]
                )?,
            },
        })
    }

    /// Get the global metrics instance
    pub fn global() -> &'static Metrics {
        static INSTANCE: Lazy<Metrics> = Lazy::new(|| {
            Metrics::new().expect("Failed to initialize metrics")
        });
        &INSTANCE
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_text() -> Result<String> {
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::types::Error::internal(e.to_string()))
}
