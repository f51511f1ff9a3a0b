//! Configuration and logging setup

/// Application configuration
pub mod config;

/// Logging macros and subscriber setup
pub mod logging;

// Re-export commonly used items
pub use config::{
    BalancerConfig, Config, IndexConfig, LoggingConfig, MetricsConfig, PeerConfig,
    TransferConfig,
};
