//! UDP socket creation

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::UdpSocket;

use crate::error::NetworkError;

/// Bind a non-blocking UDP socket with the requested kernel buffer sizes
/// and hand it to tokio. Port 0 lets the OS pick a free port.
pub fn create_socket(
    addr: SocketAddr,
    recv_buffer_size: usize,
    send_buffer_size: usize,
) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(format!("SO_REUSEADDR: {}", e)))?;

    // Buffer sizes are hints; the kernel may clamp them
    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
        tracing::warn!("Failed to set receive buffer size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(send_buffer_size) {
        tracing::warn!("Failed to set send buffer size: {}", e);
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    UdpSocket::from_std(socket.into()).map_err(|e| NetworkError::BindFailed(e.to_string()))
}
