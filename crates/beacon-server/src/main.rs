//! beacon-server binary: wires the hub and HTTP layer together.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use beacon_hub::Hub;
use beacon_server::config::ServerConfig;
use beacon_server::shutdown::ShutdownCoordinator;
use beacon_server::{logging, metrics, server};

/// Wallet-keyed realtime notification hub.
#[derive(Parser, Debug)]
#[command(name = "beacon-server", about = "Wallet-keyed realtime notification hub")]
struct Cli {
    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config, 0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter (RUST_LOG takes precedence when set).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_subscriber(&cli.log_level);

    let mut config = ServerConfig::load().context("failed to load configuration")?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let hub = Hub::spawn(config.hub_config());
    let prometheus = metrics::install_recorder();
    let shutdown = Arc::new(ShutdownCoordinator::new());

    let handle = server::start(&config, hub, prometheus, Arc::clone(&shutdown))
        .await
        .context("failed to start server")?;
    tracing::info!(addr = %handle.local_addr, "beacon-server started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    shutdown.drain(vec![handle.task], Duration::from_secs(10)).await;

    Ok(())
}
