//! Logging utilities
//!
//! Thin macros over `tracing` so every crate in the workspace logs the same
//! way, plus the subscriber setup used by both binaries.

use crate::core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Info level logging - general information messages
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        tracing::info!($($arg)*);
    }};
}

/// Warning level logging - potentially problematic situations
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        tracing::warn!($($arg)*);
    }};
}

/// Error level logging - error conditions
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
    }};
}

/// Debug level logging - detailed information for debugging
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        tracing::debug!($($arg)*);
    }};
}

/// Trace level logging - very detailed tracing information
#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        tracing::trace!($($arg)*);
    }};
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice is
/// harmless; the second subscriber is ignored.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format.as_str() {
        "compact" => builder.compact().try_init(),
        _ => builder.try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
