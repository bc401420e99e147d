//! Per-client record of a conference
//!
//! One record per client id holds every channel's registration, so a
//! client can never be half-removed from one table and left in another.

use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::network::encode_message;
use crate::protocol::{ControlMessage, HostPort, MediaChannel};

/// Item queued to a control connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded control message body; the writer adds the length prefix
    Frame(Bytes),
    /// Bare teardown notice; the writer closes after sending it
    Cancelled,
}

/// Handle to a live control connection
#[derive(Debug, Clone)]
pub struct TextLink {
    /// Identifies the connection that owns this link
    pub conn_id: Uuid,
    /// Remote address of the control connection
    pub addr: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TextLink {
    pub fn new(conn_id: Uuid, addr: SocketAddr, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { conn_id, addr, tx }
    }

    /// Queue an already-encoded message; false once the writer is gone
    pub fn send_frame(&self, frame: Bytes) -> bool {
        self.tx.send(Outbound::Frame(frame)).is_ok()
    }

    /// Encode and queue a message
    pub fn send(&self, msg: &ControlMessage) -> bool {
        match encode_message(msg) {
            Ok(frame) => self.send_frame(frame),
            Err(e) => {
                tracing::error!(kind = msg.kind(), error = %e, "Failed to encode control message");
                false
            }
        }
    }

    pub fn send_cancelled(&self) -> bool {
        self.tx.send(Outbound::Cancelled).is_ok()
    }
}

/// Everything the session knows about one client
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: String,
    pub text: Option<TextLink>,
    pub video: Option<SocketAddr>,
    pub audio: Option<SocketAddr>,
    /// When the first registration of any channel arrived
    pub registered_at: Instant,
}

impl ClientSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: None,
            video: None,
            audio: None,
            registered_at: Instant::now(),
        }
    }

    pub fn media(&self, channel: MediaChannel) -> Option<SocketAddr> {
        match channel {
            MediaChannel::Video => self.video,
            MediaChannel::Audio => self.audio,
        }
    }

    /// Replace a channel address, returning the previous one
    pub fn set_media(&mut self, channel: MediaChannel, addr: Option<SocketAddr>) -> Option<SocketAddr> {
        match channel {
            MediaChannel::Video => std::mem::replace(&mut self.video, addr),
            MediaChannel::Audio => std::mem::replace(&mut self.audio, addr),
        }
    }

    /// No channel is registered any more
    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.video.is_none() && self.audio.is_none()
    }

    /// Registered on every media channel
    pub fn has_all_media(&self) -> bool {
        MediaChannel::ALL.iter().all(|ch| self.media(*ch).is_some())
    }

    /// Every address a teardown notice should reach
    pub fn media_addrs(&self) -> impl Iterator<Item = (MediaChannel, SocketAddr)> + '_ {
        MediaChannel::ALL
            .into_iter()
            .filter_map(move |ch| self.media(ch).map(|addr| (ch, addr)))
    }
}

/// `SocketAddr` as the `(ip, port)` pair clients expect
pub fn host_port(addr: SocketAddr) -> HostPort {
    (addr.ip().to_string(), addr.port())
}
