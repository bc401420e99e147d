//! Control-plane message definitions
//!
//! Control messages travel as length-prefixed JSON objects whose `type`
//! field selects the variant. Registry requests use the same JSON shape
//! but one request per connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `(ip, port)` pair as exchanged with clients
pub type HostPort = (String, u16);

/// Conference topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mode {
    /// Media and text flow through the relay
    #[default]
    #[serde(rename = "Client-Server")]
    ClientServer,
    /// Two clients talk directly
    #[serde(rename = "Peer-to-Peer")]
    PeerToPeer,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::ClientServer => f.write_str("Client-Server"),
            Mode::PeerToPeer => f.write_str("Peer-to-Peer"),
        }
    }
}

/// Datagram media channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaChannel {
    Video,
    Audio,
}

impl MediaChannel {
    pub const ALL: [MediaChannel; 2] = [MediaChannel::Video, MediaChannel::Audio];

    pub fn name(&self) -> &'static str {
        match self {
            MediaChannel::Video => "video",
            MediaChannel::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A peer's direct-traffic addresses, one per channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddrs {
    pub text: HostPort,
    pub video: HostPort,
    pub audio: HostPort,
}

/// In-conference control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Binds a client id to the sending connection or socket
    InitConference { client_id: String },
    /// Client leaves the conference
    QuitConference {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    /// Manager ends the conference for everyone
    CancelConference {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    /// Chat line, relayed to every other participant
    TextMessage {
        message: String,
        #[serde(default = "undefined_sender")]
        sender_name: String,
        #[serde(default)]
        timestamp: Option<String>,
    },
    /// Client -> relay: `p2p_info` carries the announced port.
    /// Relay -> client: `peer_addr` carries the other peer's addresses.
    P2pInfosNotification {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        p2p_info: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_addr: Option<PeerAddrs>,
    },
    SwitchToP2p,
    SwitchToCs,
}

fn undefined_sender() -> String {
    "undefined".to_string()
}

impl ControlMessage {
    pub fn init(client_id: impl Into<String>) -> Self {
        ControlMessage::InitConference { client_id: client_id.into() }
    }

    pub fn text(message: impl Into<String>, sender_name: impl Into<String>, timestamp: Option<String>) -> Self {
        ControlMessage::TextMessage {
            message: message.into(),
            sender_name: sender_name.into(),
            timestamp,
        }
    }

    pub fn peer_info(peer_addr: PeerAddrs) -> Self {
        ControlMessage::P2pInfosNotification { p2p_info: None, peer_addr: Some(peer_addr) }
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::InitConference { .. } => "init_conference",
            ControlMessage::QuitConference { .. } => "quit_conference",
            ControlMessage::CancelConference { .. } => "cancel_conference",
            ControlMessage::TextMessage { .. } => "text_message",
            ControlMessage::P2pInfosNotification { .. } => "p2p_infos_notification",
            ControlMessage::SwitchToP2p => "switch_to_p2p",
            ControlMessage::SwitchToCs => "switch_to_cs",
        }
    }
}

/// Per-channel media ports of a conference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPorts {
    pub video: u16,
    pub audio: u16,
}

/// Snapshot of a running conference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceInfo {
    pub conference_id: u32,
    pub conference_name: String,
    pub manager_id: String,
    pub mode: Mode,
    pub participants: Vec<String>,
    pub control_port: u16,
    pub data_ports: DataPorts,
    pub created_at: DateTime<Utc>,
}

/// Request accepted by the conference registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryRequest {
    CreateConference {
        client_id: String,
        #[serde(default)]
        conference_name: Option<String>,
    },
    JoinConference { conference_id: u32 },
    GetConferences,
    CancelConference {
        conference_id: u32,
        #[serde(default)]
        client_id: Option<String>,
    },
    Login {},
    Register {},
    Logout {},
}

/// Outcome flag of a registry response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
}

/// Registry response; only the fields relevant to the request are set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conference_serve_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_serve_ports: Option<DataPorts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conferences: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conferences_detail: Option<Vec<ConferenceInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RegistryResponse {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            conference_id: None,
            conference_serve_port: None,
            data_serve_ports: None,
            conferences: None,
            conferences_detail: None,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            message: Some(message.into()),
            ..Self::success()
        }
    }
}
