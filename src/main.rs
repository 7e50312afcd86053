use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use wiretap::config::{Config, LoggingConfig};
use wiretap::journal::Journal;
use wiretap::proxy::ProxyServer;
use wiretap::Hub;

#[derive(Parser)]
#[command(name = "wiretap")]
#[command(about = "Observable HTTP reverse proxy with live request inspection")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configuration drives the log filter, so load it before tracing init
    let config = Config::from_file(&args.config).await?;
    init_tracing(&config.logging, args.verbose)?;

    info!("Starting wiretap proxy");
    info!("Loaded configuration from {}", args.config);

    let journal = Journal::with_defaults("data").await?;
    let hub = Hub::new(config.websocket.broadcast_size, Some(journal));
    tokio::spawn(Arc::clone(&hub).run());

    let shutdown_budget = Duration::from_secs(config.server.timeouts.shutdown.max(1));
    let config = Arc::new(config);
    let server = ProxyServer::new(Arc::clone(&config), Arc::clone(&hub), &args.config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server.run(shutdown_rx));

    signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    warn!("Received CTRL+C, shutting down gracefully...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(shutdown_budget, server_task).await {
        Ok(joined) => match joined {
            Ok(result) => result?,
            Err(e) => warn!("Server task failed during shutdown: {}", e),
        },
        Err(_) => warn!(
            "Shutdown budget of {:?} exceeded, abandoning in-flight requests",
            shutdown_budget
        ),
    }

    info!("wiretap shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        logging.level.as_str()
    };
    let filter = format!("wiretap={}", level);

    match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    Ok(())
}
