//! HTTP server for the status API

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::config::UiConfig;
use crate::registry::Registry;
use crate::ui::handlers;

/// Serves the status API over the registry
pub struct WebServer {
    config: UiConfig,
    registry: Arc<Registry>,
}

impl WebServer {
    pub fn new(config: UiConfig, registry: Arc<Registry>) -> Self {
        Self { config, registry }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/conferences", get(handlers::get_conferences))
            .route(
                "/api/conferences/:id",
                get(handlers::get_conference).delete(handlers::cancel_conference),
            )
            .layer(CorsLayer::permissive())
            .with_state(Arc::clone(&self.registry))
    }

    /// Bind and serve until the process exits
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Status API listening on http://{}", addr);

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Spawn the server on the current runtime
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Status API error: {}", e);
            }
        })
    }
}
