//! Peershare index balancer
//!
//! Fronts the directory index replicas with a single address, routing each
//! request to the least-loaded healthy replica.

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use peershare_balancer::Balancer;
use peershare_core::core::logging;
use peershare_core::{log_error, log_info, log_warn, Config};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;

const DEFAULT_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("peershare-balancer")
        .version(peershare_core::VERSION)
        .about("Health-checking load balancer for the directory index")
        .arg(
            Arg::new("port")
                .value_name("PORT")
                .help("Listen port on all interfaces")
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .help("Listen address, overrides PORT")
        )
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .value_name("URL")
                .action(ArgAction::Append)
                .help("Index replica base URL, repeat for each replica")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
        )
        .get_matches();

    // Load configuration
    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let mut config = Config::load(config_path)?;

    // Apply CLI overrides
    let port_warning = apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    logging::init(&config.logging);
    log_info!("Starting peershare-balancer v{}", peershare_core::VERSION);
    if let Some(warning) = port_warning {
        log_warn!("{}", warning);
    }

    let listen = config.balancer.listen_addr;
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Port {} is not available", listen.port()))?;

    let balancer = Balancer::new(&config.balancer)?;

    if config.metrics.enable_prometheus {
        let metrics = config.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = peershare_balancer::serve_metrics(&metrics).await {
                log_error!("Metrics server failed: {}", e);
            }
        });
    }

    balancer.serve(listener, setup_shutdown_handler()).await?;

    log_info!("Shutdown complete");
    Ok(())
}

/// Apply command line argument overrides to configuration, returning a
/// warning for an unusable positional port.
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) -> anyhow::Result<Option<String>> {
    let mut warning = None;
    if let Some(raw) = matches.get_one::<String>("port") {
        let port = raw.parse::<u16>().unwrap_or_else(|_| {
            warning = Some(format!("Invalid port '{}', using {}", raw, DEFAULT_PORT));
            DEFAULT_PORT
        });
        config.balancer.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
    }

    if let Some(addr) = matches.get_one::<String>("listen") {
        config.balancer.listen_addr = addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", addr))?;
    }

    let backends: Vec<String> = matches
        .get_many::<String>("backend")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if !backends.is_empty() {
        config.balancer.backends = backends;
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    Ok(warning)
}

/// Setup graceful shutdown signal handling
async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log_warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log_warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log_info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            log_info!("Received terminate signal");
        },
    }
}
