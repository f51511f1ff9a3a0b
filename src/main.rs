//! Peershare peer node
//!
//! Joins the network, publishes a folder and serves it to other peers, and
//! offers search and download from an interactive prompt. One-shot
//! subcommands cover search, download and sync without joining.

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use peershare::directory::DirectoryClient;
use peershare::sync::SyncEngine;
use peershare::transfer::{DownloadHandle, DownloadRequest, TransferClient, TransferEvent};
use peershare::{FileRecord, PeerNode};
use peershare_core::core::logging;
use peershare_core::{log_info, log_warn, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("peershare")
        .version(peershare::VERSION)
        .about("Peer-to-peer file sharing node")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Log level (trace, debug, info, warn, error)")
        )
        .arg(
            Arg::new("username")
                .short('u')
                .long("username")
                .value_name("NAME")
                .global(true)
                .help("Username on the network")
        )
        .arg(
            Arg::new("publish-dir")
                .long("publish-dir")
                .value_name("DIR")
                .global(true)
                .help("Folder to share")
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .global(true)
                .help("Transfer server port (0 = first free port from 6000)")
        )
        .arg(
            Arg::new("index")
                .long("index")
                .value_name("URL")
                .action(ArgAction::Append)
                .global(true)
                .help("Directory index endpoint, repeat for replicas")
        )
        .subcommand(Command::new("run").about("Join the network and open the interactive prompt (default)"))
        .subcommand(
            Command::new("search")
                .about("Search files shared by online peers")
                .arg(Arg::new("query").num_args(0..).help("Words to match in filenames"))
        )
        .subcommand(
            Command::new("download")
                .about("Download the first file matching a query")
                .arg(Arg::new("query").required(true).num_args(1..).help("Words to match in filenames"))
                .arg(Arg::new("owner").long("owner").value_name("USER").help("Only take files from this peer"))
                .arg(Arg::new("dest").long("dest").value_name("DIR").help("Download directory"))
        )
        .subcommand(Command::new("sync").about("Publish the folder contents once and exit"))
        .get_matches();

    // Load configuration
    let config_path = matches.get_one::<String>("config").map(|s| s.as_str());
    let mut config = Config::load(config_path)?;

    // Apply CLI overrides
    apply_cli_overrides(&mut config, &matches)?;
    config.validate()?;

    logging::init(&config.logging);
    log_info!("Starting {} v{}", peershare::NAME, peershare::VERSION);

    match matches.subcommand() {
        Some(("search", sub)) => search_once(&config, &joined_words(sub)).await,
        Some(("download", sub)) => {
            let dest = sub
                .get_one::<String>("dest")
                .map(PathBuf::from)
                .unwrap_or_else(|| config.peer.download_dir().to_path_buf());
            download_once(&config, &joined_words(sub), sub.get_one::<String>("owner").map(String::as_str), dest).await
        }
        Some(("sync", _)) => sync_once(&config).await,
        _ => run_session(&config).await,
    }
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) -> anyhow::Result<()> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }

    if let Some(username) = matches.get_one::<String>("username") {
        config.peer.username = username.clone();
    }

    if let Some(dir) = matches.get_one::<String>("publish-dir") {
        config.peer.publish_dir = dir.into();
    }

    if let Some(port) = matches.get_one::<String>("port") {
        config.peer.port = port.parse().with_context(|| format!("Invalid port: {}", port))?;
    }

    let endpoints: Vec<String> = matches
        .get_many::<String>("index")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if !endpoints.is_empty() {
        config.index.endpoints = endpoints;
    }

    Ok(())
}

fn joined_words(matches: &ArgMatches) -> String {
    matches
        .get_many::<String>("query")
        .map(|words| words.cloned().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

async fn connect_directory(config: &Config) -> anyhow::Result<Arc<DirectoryClient>> {
    let directory = Arc::new(DirectoryClient::solr(&config.index)?);
    directory.connect().await?;
    Ok(directory)
}

async fn search_once(config: &Config, query: &str) -> anyhow::Result<()> {
    let directory = connect_directory(config).await?;
    let results = directory.search_files(query, &config.peer.username).await?;
    print_results(&results);
    Ok(())
}

async fn download_once(config: &Config, query: &str, owner: Option<&str>, dest: PathBuf) -> anyhow::Result<()> {
    let directory = connect_directory(config).await?;
    let results = directory.search_files(query, &config.peer.username).await?;
    let Some(hit) = results.iter().find(|r| owner.map_or(true, |o| r.owner == o)) else {
        bail!("no online peer shares a file matching '{}'", query);
    };
    if !peershare::transfer::protocol::is_valid_filename(&hit.filename) {
        bail!("refusing to download '{}': name escapes the download directory", hit.filename);
    }
    let Some(request) = DownloadRequest::for_record(hit, dest.join(&hit.filename)) else {
        bail!("owner of '{}' has no address", hit.filename);
    };

    let client = TransferClient::new(&config.transfer);
    let result = report_progress(client.download(request)).await;
    client.shutdown().await;
    let outcome = result?;
    println!("Saved {} ({} bytes)", outcome.path.display(), outcome.bytes);
    Ok(())
}

async fn sync_once(config: &Config) -> anyhow::Result<()> {
    config.validate_peer()?;
    let directory = connect_directory(config).await?;
    let engine = SyncEngine::new(directory, config.peer.username.trim(), &config.peer.publish_dir);
    let report = engine.synchronize().await?;
    println!(
        "{} file(s) shared: {} published, {} retracted, {} skipped",
        report.scanned, report.added, report.removed, report.skipped
    );
    Ok(())
}

/// Join, then read commands from stdin until `quit` or a shutdown signal.
async fn run_session(config: &Config) -> anyhow::Result<()> {
    let node = PeerNode::join(config).await?;
    println!(
        "Joined as '{}' on {}. Type 'help' for commands.",
        node.identity().username,
        node.identity().addr()
    );

    let shutdown = setup_shutdown_handler();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut last_results: Vec<FileRecord> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log_warn!("Received shutdown signal, leaving the network...");
                break;
            }
            line = lines.next_line(), if stdin_open => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        stdin_open = false;
                        continue;
                    }
                };
                let (command, rest) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
                match command {
                    "" => {}
                    "quit" | "exit" => break,
                    "help" => print_help(),
                    "search" => match node.search(rest).await {
                        Ok(results) => {
                            print_results(&results);
                            last_results = results;
                        }
                        Err(e) => println!("Search failed: {}", e),
                    },
                    "get" => {
                        let picked = rest.trim().parse::<usize>().ok()
                            .and_then(|n| n.checked_sub(1))
                            .and_then(|i| last_results.get(i));
                        match picked {
                            Some(record) => match node.download(record) {
                                Ok(handle) => {
                                    tokio::spawn(async move {
                                        if let Err(e) = report_progress(handle).await {
                                            println!("Download failed: {}", e);
                                        }
                                    });
                                }
                                Err(e) => println!("{}", e),
                            },
                            None => println!("Usage: get <result number from the last search>"),
                        }
                    }
                    "sync" => match node.resync().await {
                        Ok(report) => println!(
                            "{} file(s) shared: {} published, {} retracted",
                            report.scanned, report.added, report.removed
                        ),
                        Err(e) => println!("Sync failed: {}", e),
                    },
                    "files" => {
                        for file in node.shared_files() {
                            println!("  {} ({} bytes)", file.filename, file.size);
                        }
                    }
                    other => println!("Unknown command '{}'. Type 'help'.", other),
                }
            }
        }
    }

    let summary = node.leave().await?;
    log_info!("Shutdown complete ({})", summary);
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  search <words>   find files shared by other online peers");
    println!("  get <n>          download result n of the last search");
    println!("  sync             rescan the publish folder now");
    println!("  files            list the files you share");
    println!("  quit             leave the network");
}

fn print_results(results: &[FileRecord]) {
    if results.is_empty() {
        println!("No files found.");
        return;
    }
    for (i, record) in results.iter().enumerate() {
        let addr = record.owner_addr.map(|a| a.to_string()).unwrap_or_default();
        println!("{:>3}. {} ({} bytes) from {} at {}", i + 1, record.filename, record.size, record.owner, addr);
    }
}

/// Print progress events and return the final outcome.
async fn report_progress(
    mut handle: DownloadHandle,
) -> Result<peershare::transfer::TransferOutcome, peershare::TransferError> {
    let id = handle.id();
    while let Some(event) = handle.next_event().await {
        match event {
            TransferEvent::Started { attempt } if attempt > 1 => println!("[{}] attempt {}", id, attempt),
            TransferEvent::Started { .. } => {}
            TransferEvent::Progress { received, total } => {
                let percent = if total == 0 { 100 } else { received * 100 / total };
                println!("[{}] {}% ({} of {} bytes)", id, percent, received, total);
            }
            TransferEvent::Retrying { attempt, error } => {
                println!("[{}] attempt {} failed: {}", id, attempt, error);
            }
            TransferEvent::Finished(result) => {
                if let Ok(outcome) = &result {
                    println!("[{}] saved {}", id, outcome.path.display());
                }
                return result;
            }
        }
    }
    Err(peershare::TransferError::Cancelled)
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
