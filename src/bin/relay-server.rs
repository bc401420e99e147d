//! Conference Relay Server
//!
//! Runs the conference registry and, when enabled, the HTTP status API.
//! Usage: `relay-server [config.toml]`

use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conference_relay::{
    config::AppConfig,
    registry::{Registry, RegistryServer},
    ui::WebServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conference Relay");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path)?;

    let registry = Registry::new(config.clone());
    let server = RegistryServer::bind(registry.clone()).await?;
    tracing::info!("Registry available at {}", server.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry_task = tokio::spawn(server.run(shutdown_rx));

    let web_handle = if config.ui.enabled {
        let web_server = WebServer::new(config.ui.clone(), registry.clone());
        tracing::info!("Status API available at http://{}:{}", config.ui.bind_address, config.ui.http_port);
        Some(web_server.start_background())
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    shutdown_tx.send_replace(true);
    if let Err(e) = registry_task.await {
        tracing::warn!("Registry task ended abnormally: {}", e);
    }
    registry.shutdown();
    if let Some(handle) = web_handle {
        handle.abort();
    }

    tracing::info!("Relay stopped");
    Ok(())
}
