//! Registry listener
//!
//! One length-prefixed JSON request per connection, answered with one
//! JSON response before the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};
use crate::network::{control_transport, read_json, write_json};
use crate::protocol::{RegistryRequest, RegistryResponse};
use crate::registry::Registry;

/// Accepts registry connections
pub struct RegistryServer {
    registry: Arc<Registry>,
    listener: TcpListener,
}

impl RegistryServer {
    /// Bind the configured registry address
    pub async fn bind(registry: Arc<Registry>) -> Result<Self> {
        let addr = format!(
            "{}:{}",
            registry.config().registry.bind_address,
            registry.config().registry.port
        );
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        Ok(Self { registry, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "Registry listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_request(Arc::clone(&self.registry), stream, peer));
                    }
                    Err(e) => warn!(error = %e, "Registry accept failed"),
                }
            }
        }
        debug!("Registry listener closed");
    }
}

async fn serve_request(registry: Arc<Registry>, stream: TcpStream, peer: SocketAddr) {
    let max_len = registry.config().session.max_control_message;
    let mut stream = control_transport(stream, max_len);

    let response = match read_json::<RegistryRequest, _>(&mut stream).await {
        Ok(request) => {
            debug!(%peer, ?request, "Registry request");
            registry.handle_request(request).await
        }
        Err(e) if e.is_disconnect() => return,
        Err(e) => {
            warn!(%peer, error = %e, "Bad registry request");
            RegistryResponse::failed(e.to_string())
        }
    };

    if let Err(e) = write_json(&mut stream, &response).await {
        debug!(%peer, error = %e, "Registry response not delivered");
    }
    let _ = stream.get_mut().shutdown().await;
}
