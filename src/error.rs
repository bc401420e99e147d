//! Error types for the conference relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Media packet framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed packet: need {needed} bytes, got {available}")]
    MalformedPacket { needed: usize, available: usize },

    #[error("Client id is not valid UTF-8")]
    InvalidClientId,

    #[error("Client id too long: {0} bytes")]
    ClientIdTooLong(usize),

    #[error("Datagram size {0} leaves no room for payload")]
    DatagramTooSmall(usize),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Control message exceeds the frame limit")]
    MessageTooLarge,

    #[error("Invalid control message: {0}")]
    InvalidMessage(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl NetworkError {
    /// Whether this error is an ordinary peer disconnect rather than a fault
    pub fn is_disconnect(&self) -> bool {
        matches!(self, NetworkError::ConnectionClosed)
    }
}

/// Conference session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Client {requester} is not the manager of conference {conference_id}")]
    NotManager { conference_id: u32, requester: String },

    #[error("P2P handoff timed out in conference {0}")]
    HandoffTimeout(u32),

    #[error("Manager left conference {0}")]
    ManagerLeftConference(u32),

    #[error("Conference {0} is not running")]
    NotRunning(u32),
}

/// Conference registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Conference {0} not found")]
    ConferenceNotFound(u32),

    #[error("No free conference id")]
    IdsExhausted,

    #[error("Unsupported request: {0}")]
    Unsupported(String),
}

/// Whether an IO error is an expected client disconnect
pub fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
