//! Configuration for peershare
//!
//! One TOML file configures both binaries; each reads the sections it needs.
//! Values are resolved as defaults, then the file, then `PEERSHARE_*`
//! environment variables, then command line flags applied by the binary.

use crate::types::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "peershare.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local peer identity and publish directory
    pub peer: PeerConfig,

    /// Directory index service endpoints and failover policy
    pub index: IndexConfig,

    /// Peer-to-peer transfer tuning
    pub transfer: TransferConfig,

    /// Load balancer settings
    pub balancer: BalancerConfig,

    /// Metrics and monitoring
    pub metrics: MetricsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Unique username on the network
    pub username: String,

    /// Folder whose regular files are shared
    pub publish_dir: PathBuf,

    /// Folder downloads are written into (defaults to the publish dir)
    pub download_dir: Option<PathBuf>,

    /// Transfer server port, 0 selects the first free port from 6000
    pub port: u16,

    /// Address advertised to other peers, discovered when absent
    pub advertise_ip: Option<IpAddr>,

    /// Interval for background resynchronisation, disabled when absent
    #[serde(with = "option_duration_str")]
    pub resync_interval: Option<Duration>,
}

/// Directory index service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Equivalent index-service base URLs, tried in round-robin order
    pub endpoints: Vec<String>,

    /// Attempts per logical operation, failover included
    pub max_attempts: usize,

    /// TCP connect timeout towards an endpoint
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,

    /// Whole-request timeout towards an endpoint
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Soft commit window attached to every write
    #[serde(with = "duration_str")]
    pub commit_within: Duration,

    /// Maximum hits returned by a filename search
    pub search_rows: usize,

    /// Maximum online peers resolved per search
    pub peer_rows: usize,
}

/// Transfer server and client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent connections served by the transfer server
    pub server_workers: usize,

    /// Concurrent downloads run by the transfer client
    pub download_workers: usize,

    /// Bytes per read/write while streaming a file
    pub chunk_size: usize,

    /// Connect timeout towards a remote peer
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,

    /// Timeout of a single socket read
    #[serde(with = "duration_str")]
    pub read_timeout: Duration,

    /// Window without byte progress after which a download is stalled
    #[serde(with = "duration_str")]
    pub stall_timeout: Duration,

    /// Retries after the first attempt for transient failures
    pub max_retries: u32,

    /// Fixed pause between attempts
    #[serde(with = "duration_str")]
    pub retry_backoff: Duration,

    /// Minimum spacing between progress events
    #[serde(with = "duration_str")]
    pub progress_interval: Duration,

    /// Grace period for in-flight uploads on server shutdown
    #[serde(with = "duration_str")]
    pub server_shutdown_grace: Duration,

    /// Grace period for in-flight downloads on client shutdown
    #[serde(with = "duration_str")]
    pub client_shutdown_grace: Duration,
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Index-service replicas behind the balancer
    pub backends: Vec<String>,

    /// Pause between health probe rounds
    #[serde(with = "duration_str")]
    pub health_interval: Duration,

    /// Timeout of a single health probe
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,

    /// Liveness path appended to each backend base URL
    pub health_path: String,

    /// Requests relayed concurrently, excess requests wait
    pub max_concurrent: usize,

    /// Connect timeout towards a backend
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,

    /// Whole-request timeout towards a backend
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Largest inbound request body buffered before forwarding
    pub max_body_bytes: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    pub enable_prometheus: bool,

    /// Metrics server bind address
    pub metrics_addr: SocketAddr,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (pretty, compact)
    pub format: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            publish_dir: PathBuf::from("./shared"),
            download_dir: None,
            port: 0,
            advertise_ip: None,
            resync_interval: None,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            max_attempts: 3,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            commit_within: Duration::from_secs(10),
            search_rows: 500,
            peer_rows: 10_000,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            server_workers: 5,
            download_workers: 3,
            chunk_size: 8192,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_backoff: Duration::from_millis(1500),
            progress_interval: Duration::from_millis(250),
            server_shutdown_grace: Duration::from_secs(3),
            client_shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backends: default_endpoints(),
            health_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            health_path: "admin/ping?wt=json".to_string(),
            max_concurrent: 10,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_prometheus: false,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn default_endpoints() -> Vec<String> {
    vec![
        "http://localhost:8983/solr/napster_clone/".to_string(),
        "http://localhost:8984/solr/napster_clone/".to_string(),
    ]
}

impl PeerConfig {
    /// Directory downloads land in
    pub fn download_dir(&self) -> &Path {
        self.download_dir.as_deref().unwrap_or(&self.publish_dir)
    }
}

impl Config {
    /// Load configuration from `path`, or from `peershare.toml` when it
    /// exists, then apply environment overrides and validate.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };

        // Override with environment variables
        config.apply_env_overrides()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        // Peer overrides
        if let Ok(username) = env::var("PEERSHARE_USERNAME") {
            self.peer.username = username;
        }

        if let Ok(dir) = env::var("PEERSHARE_PUBLISH_DIR") {
            self.peer.publish_dir = PathBuf::from(dir);
        }

        if let Ok(port) = env::var("PEERSHARE_PORT") {
            self.peer.port = port.parse()
                .map_err(|e| Error::config(format!("Invalid port: {}", e)))?;
        }

        // Index overrides
        if let Ok(endpoints) = env::var("PEERSHARE_INDEX_ENDPOINTS") {
            self.index.endpoints = split_list(&endpoints);
        }

        // Balancer overrides
        if let Ok(addr) = env::var("PEERSHARE_BALANCER_ADDR") {
            self.balancer.listen_addr = addr.parse()
                .map_err(|e| Error::config(format!("Invalid balancer address: {}", e)))?;
        }

        if let Ok(backends) = env::var("PEERSHARE_BALANCER_BACKENDS") {
            self.balancer.backends = split_list(&backends);
        }

        // Logging overrides
        if let Ok(level) = env::var("PEERSHARE_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = env::var("PEERSHARE_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.index.endpoints.is_empty() {
            return Err(Error::config("At least one index endpoint is required"));
        }
        for endpoint in self.index.endpoints.iter().chain(self.balancer.backends.iter()) {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::config(format!("Endpoint is not an http(s) URL: {}", endpoint)));
            }
        }
        if self.index.max_attempts == 0 {
            return Err(Error::config("index.max_attempts must be at least 1"));
        }
        require_nonzero("index.connect_timeout", self.index.connect_timeout)?;
        require_nonzero("index.request_timeout", self.index.request_timeout)?;

        if self.transfer.server_workers == 0 || self.transfer.download_workers == 0 {
            return Err(Error::config("Transfer worker pools need at least one worker"));
        }
        if self.transfer.chunk_size == 0 {
            return Err(Error::config("transfer.chunk_size must be positive"));
        }
        require_nonzero("transfer.connect_timeout", self.transfer.connect_timeout)?;
        require_nonzero("transfer.read_timeout", self.transfer.read_timeout)?;
        require_nonzero("transfer.stall_timeout", self.transfer.stall_timeout)?;

        if self.balancer.max_concurrent == 0 {
            return Err(Error::config("balancer.max_concurrent must be at least 1"));
        }
        require_nonzero("balancer.health_interval", self.balancer.health_interval)?;
        require_nonzero("balancer.probe_timeout", self.balancer.probe_timeout)?;
        require_nonzero("balancer.connect_timeout", self.balancer.connect_timeout)?;
        require_nonzero("balancer.request_timeout", self.balancer.request_timeout)?;

        // Validate log level
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {},
            _ => return Err(Error::config("Invalid log level")),
        }

        Ok(())
    }

    /// Checks the settings only the peer node needs.
    pub fn validate_peer(&self) -> Result<()> {
        let username = self.peer.username.trim();
        if username.is_empty() {
            return Err(Error::config("peer.username is required"));
        }
        if username.chars().any(char::is_whitespace) {
            return Err(Error::config("peer.username must not contain whitespace"));
        }
        if let Some(every) = self.peer.resync_interval {
            require_nonzero("peer.resync_interval", every)?;
        }
        Ok(())
    }
}

fn require_nonzero(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(Error::config(format!("{} must be greater than zero", name)));
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Simple duration parser for common formats
/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let ms: u64 = ms.parse().map_err(|_| "Invalid milliseconds")?;
        Ok(Duration::from_millis(ms))
    } else if let Some(secs) = s.strip_suffix('s') {
        let secs: u64 = secs.parse().map_err(|_| "Invalid seconds")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins: u64 = mins.parse().map_err(|_| "Invalid minutes")?;
        let secs = mins.checked_mul(60).ok_or("Duration too large")?;
        Ok(Duration::from_secs(secs))
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours: u64 = hours.parse().map_err(|_| "Invalid hours")?;
        let secs = hours.checked_mul(3600).ok_or("Duration too large")?;
        Ok(Duration::from_secs(secs))
    } else {
        // Try parsing as raw seconds
        let secs: u64 = s.parse().map_err(|_| "Invalid duration format")?;
        Ok(Duration::from_secs(secs))
    }
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

mod duration_str {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a duration string like '30s' or '250ms'")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Duration, E> {
                super::parse_duration(value).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Duration, E> {
                u64::try_from(value)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom("negative duration"))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&super::format_duration(d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
