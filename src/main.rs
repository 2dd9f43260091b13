//! edged daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use edged::config::Config;
use edged::dns_server::{run_dns_server, NextOrFailure};
use edged::edge::Edge;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load and validate configuration
    let cfg = Config::load()?;
    info!("Starting edged with config: {:?}", cfg);
    let edge = Arc::new(Edge::from_config(&cfg)?);

    // Table sync, service reader, health checks and pushes
    let push_addr = edge.on_startup().await?;
    info!("Accepting table updates on {}", push_addr);

    // DNS Server
    let edge_for_dns = Arc::clone(&edge);
    let dns_bind = cfg.dns_bind;
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = run_dns_server(dns_bind, edge_for_dns, Arc::new(NextOrFailure)).await {
            error!("DNS server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    dns_handle.abort();
    edge.on_shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}
