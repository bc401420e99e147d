//! # Conference Relay
//!
//! Multi-party video conferencing relay: text, video and audio routed
//! through one server, or handed off to a direct peer link when exactly
//! two participants remain.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                               CLIENTS                                        │
//! │   ┌──────────┐          ┌──────────┐          ┌──────────┐                   │
//! │   │ Client A │          │ Client B │          │ Client C │                   │
//! │   └─┬──┬──┬──┘          └─┬──┬──┬──┘          └─┬──┬──┬──┘                   │
//! │     │  │  │ TCP text       │  │  │ UDP video     │  │  │ UDP audio          │
//! └─────┼──┼──┼────────────────┼──┼──┼───────────────┼──┼──┼────────────────────┘
//!       │  │  │                │  │  │               │  │  │
//!       ▼  ▼  ▼                ▼  ▼  ▼               ▼  ▼  ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         REGISTRY (registry)                                  │
//! │   create / join / list / cancel  ──►  DashMap<id, ConferenceSession>        │
//! └─────────────────────────────────────┬───────────────────────────────────────┘
//!                                       │ one session per conference
//!                                       ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                    CONFERENCE SESSION (session::conference)                  │
//! │  ┌────────────────────┐  ┌────────────────────┐  ┌────────────────────┐     │
//! │  │ Control listener   │  │ Video router       │  │ Audio router       │     │
//! │  │ (session::         │  │ (media::router)    │  │ (media::router)    │     │
//! │  │  connection)       │  │                    │  │                    │     │
//! │  │ INIT / text /      │  │ Reassembly ──►     │  │ Reassembly ──►     │     │
//! │  │ P2P info / quit    │  │ re-chunk ──►       │  │ Audio mixer ──►    │     │
//! │  │                    │  │ fan out to others  │  │ mix back to sender │     │
//! │  └─────────┬──────────┘  └─────────┬──────────┘  └─────────┬──────────┘     │
//! │            └───────────────────────┼───────────────────────┘                │
//! │                                    ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐    │
//! │  │   Session state (one mutex): clients, mode, P2P ports, mix buffers  │    │
//! │  │   Topology: 1 ─► Client-Server, 2 ─► Peer-to-Peer, >2 ─► C-S        │    │
//! │  └─────────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Media datagrams: `[id len | ts flag][client id][total len u64][seq u32][ts f64?][payload]`

pub mod codec;
pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod ui;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default listen address for the registry and sessions
    pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

    /// Default registry TCP port
    pub const DEFAULT_REGISTRY_PORT: u16 = 8888;

    /// Default HTTP status API port
    pub const DEFAULT_HTTP_PORT: u16 = 8080;

    /// How long a mode switch waits for media registration
    pub const DEFAULT_BARRIER_TIMEOUT_MS: u64 = 5_000;

    /// How long a P2P handoff waits for both peers
    pub const DEFAULT_HANDOFF_TIMEOUT_MS: u64 = 5_000;

    /// Liveness log interval
    pub const DEFAULT_LOG_INTERVAL_SECS: u64 = 5;

    /// Largest control message body
    pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Receive buffer for one media datagram
    pub const MAX_RECV_DATAGRAM: usize = 65_536;

    /// 16-bit mono samples per mixed audio chunk
    pub const AUDIO_CHUNK_SAMPLES: usize = 4096;

    /// Kernel socket buffer size for media sockets
    pub const SOCKET_BUFFER_SIZE: usize = 1 << 20;

    /// Source id the mixed audio stream is sent under
    pub const MIX_SOURCE_ID: &str = "mix";

    /// Conference ids are four-digit integers
    pub const CONFERENCE_ID_MIN: u32 = 1000;
    pub const CONFERENCE_ID_MAX: u32 = 9999;
}
