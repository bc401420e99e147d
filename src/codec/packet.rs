//! Media packet framing
//!
//! Wire format (little-endian):
//! ```text
//! ┌──────────────┬────────────┬──────────────┬──────────────┬──────────────┬───────────┐
//! │ id_len|flag  │ client_id  │ total_length │   sequence   │ [timestamp]  │  payload  │
//! │  (4 bytes)   │ (id_len)   │  (8 bytes)   │  (4 bytes)   │ (8 bytes f64)│   (var)   │
//! └──────────────┴────────────┴──────────────┴──────────────┴──────────────┴───────────┘
//! ```
//! The high bit of the first word marks the presence of the timestamp,
//! so packets without one are byte-identical to the untimestamped form.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::ControlMessage;

/// Payload of a leaving sender
pub const TERMINATE: &[u8] = b"TERMINATE";
/// Payload of a paused stream
pub const OFF: &[u8] = b"OFF";
/// Bare teardown notice sent to every socket when a conference ends
pub const CANCELLED: &[u8] = b"Cancelled";

const TIMESTAMP_FLAG: u32 = 0x8000_0000;
const ID_LEN_MASK: u32 = !TIMESTAMP_FLAG;

/// Fixed header bytes excluding the client id and timestamp
pub const FIXED_HEADER_SIZE: usize = 4 + 8 + 4;
const TIMESTAMP_SIZE: usize = 8;

/// Header size for a given client id length
pub fn header_size(client_id_len: usize, timestamped: bool) -> usize {
    FIXED_HEADER_SIZE + client_id_len + if timestamped { TIMESTAMP_SIZE } else { 0 }
}

/// Reserved in-band stream signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaSignal {
    /// Sender left the conference for good
    Terminate,
    /// Sender paused this stream but stays in the call
    Off,
}

impl MediaSignal {
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            TERMINATE => Some(MediaSignal::Terminate),
            OFF => Some(MediaSignal::Off),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            MediaSignal::Terminate => TERMINATE,
            MediaSignal::Off => OFF,
        }
    }
}

/// One chunk of a media frame
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedPacket {
    /// Sending client
    pub client_id: String,
    /// Length of the whole frame this chunk belongs to
    pub total_length: u64,
    /// Chunk index within the frame, starting at 0
    pub sequence_number: u32,
    /// Optional capture timestamp in seconds
    pub timestamp: Option<f64>,
    /// Chunk bytes
    pub payload: Bytes,
}

impl ChunkedPacket {
    pub fn new(
        client_id: impl Into<String>,
        total_length: u64,
        sequence_number: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            total_length,
            sequence_number,
            timestamp: None,
            payload: payload.into(),
        }
    }

    /// Set the timestamp and return self
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sentinel carried by this packet, if any
    pub fn signal(&self) -> Option<MediaSignal> {
        MediaSignal::from_payload(&self.payload)
    }

    /// Serialized size
    pub fn encoded_len(&self) -> usize {
        header_size(self.client_id.len(), self.timestamp.is_some()) + self.payload.len()
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode(
            &self.client_id,
            self.total_length,
            self.sequence_number,
            self.timestamp,
            &self.payload,
        )
    }

    /// Parse wire bytes; the payload shares the input buffer
    pub fn decode(data: &Bytes) -> Result<Self, CodecError> {
        let mut buf = data.clone();

        ensure(&buf, 4, 0)?;
        let word = buf.get_u32_le();
        let id_len = (word & ID_LEN_MASK) as usize;
        let timestamped = word & TIMESTAMP_FLAG != 0;

        let consumed = 4;
        ensure(&buf, id_len + 8 + 4, consumed)?;
        let client_id = std::str::from_utf8(&buf[..id_len])
            .map_err(|_| CodecError::InvalidClientId)?
            .to_string();
        buf.advance(id_len);

        let total_length = buf.get_u64_le();
        let sequence_number = buf.get_u32_le();

        let timestamp = if timestamped {
            ensure(&buf, TIMESTAMP_SIZE, consumed + id_len + 12)?;
            Some(buf.get_f64_le())
        } else {
            None
        };

        Ok(Self {
            client_id,
            total_length,
            sequence_number,
            timestamp,
            payload: buf,
        })
    }
}

fn ensure(buf: &Bytes, needed: usize, consumed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        return Err(CodecError::MalformedPacket {
            needed: consumed + needed,
            available: consumed + buf.len(),
        });
    }
    Ok(())
}

/// Frame one chunk
pub fn encode(
    client_id: &str,
    total_length: u64,
    sequence_number: u32,
    timestamp: Option<f64>,
    payload: &[u8],
) -> Result<Bytes, CodecError> {
    let id_len = client_id.len();
    if id_len as u64 > ID_LEN_MASK as u64 {
        return Err(CodecError::ClientIdTooLong(id_len));
    }

    let mut buf = BytesMut::with_capacity(header_size(id_len, timestamp.is_some()) + payload.len());
    let flag = if timestamp.is_some() { TIMESTAMP_FLAG } else { 0 };
    buf.put_u32_le(id_len as u32 | flag);
    buf.put_slice(client_id.as_bytes());
    buf.put_u64_le(total_length);
    buf.put_u32_le(sequence_number);
    if let Some(ts) = timestamp {
        buf.put_f64_le(ts);
    }
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Parse one chunk
pub fn decode(data: &Bytes) -> Result<ChunkedPacket, CodecError> {
    ChunkedPacket::decode(data)
}

/// Anything that can arrive on a media socket
#[derive(Debug, Clone, PartialEq)]
pub enum MediaDatagram {
    /// Conference teardown notice
    Cancelled,
    /// Binds the sending address to a client id
    Init { client_id: String },
    /// A framed media chunk
    Packet(ChunkedPacket),
}

impl MediaDatagram {
    pub fn classify(data: Bytes) -> Result<Self, CodecError> {
        if data.as_ref() == CANCELLED {
            return Ok(MediaDatagram::Cancelled);
        }
        if data.first() == Some(&b'{') {
            if let Ok(ControlMessage::InitConference { client_id }) = serde_json::from_slice(&data) {
                return Ok(MediaDatagram::Init { client_id });
            }
        }
        ChunkedPacket::decode(&data).map(MediaDatagram::Packet)
    }
}
