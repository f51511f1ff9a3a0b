//! System utilities

/// Prometheus metrics
pub mod metrics;

pub use metrics::Metrics;
