//! Length-delimited JSON framing for control connections
//!
//! Each message is a 4-byte big-endian body length followed by one JSON
//! object. Framing is done by `LengthDelimitedCodec`; this module only
//! maps bodies to and from messages.

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec, LengthDelimitedCodecError};

use crate::error::{is_disconnect, NetworkError};
use crate::protocol::ControlMessage;

/// Bidirectional control stream
pub type ControlTransport<T> = Framed<T, LengthDelimitedCodec>;

fn codec(max_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(max_len).new_codec()
}

/// Frame both directions of `io`, rejecting bodies above `max_len`
pub fn control_transport<T: AsyncRead + AsyncWrite>(io: T, max_len: usize) -> ControlTransport<T> {
    LengthDelimitedCodec::builder().max_frame_length(max_len).new_framed(io)
}

/// Frame the read half of a split connection
pub fn control_reader<R: AsyncRead>(io: R, max_len: usize) -> FramedRead<R, LengthDelimitedCodec> {
    FramedRead::new(io, codec(max_len))
}

/// Frame the write half of a split connection
pub fn control_writer<W: AsyncWrite>(io: W, max_len: usize) -> FramedWrite<W, LengthDelimitedCodec> {
    FramedWrite::new(io, codec(max_len))
}

/// Serialize any JSON value into one message body
pub fn encode_json<T: Serialize>(value: &T) -> Result<Bytes, NetworkError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| NetworkError::InvalidMessage(e.to_string()))
}

/// Serialize a control message into one message body
pub fn encode_message(msg: &ControlMessage) -> Result<Bytes, NetworkError> {
    encode_json(msg)
}

/// Parse one message body
pub fn decode_message(body: &[u8]) -> Result<ControlMessage, NetworkError> {
    serde_json::from_slice(body).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
}

fn map_read_error(err: io::Error) -> NetworkError {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
    {
        NetworkError::MessageTooLarge
    } else if is_disconnect(&err) {
        NetworkError::ConnectionClosed
    } else {
        NetworkError::ReceiveFailed(err.to_string())
    }
}

/// Read one framed JSON value. A body that fails to parse is reported as
/// `InvalidMessage`; the frame is consumed, so the stream stays in sync.
pub async fn read_json<T, S>(stream: &mut S) -> Result<T, NetworkError>
where
    T: DeserializeOwned,
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    match stream.next().await {
        Some(Ok(body)) => serde_json::from_slice(&body).map_err(|e| NetworkError::InvalidMessage(e.to_string())),
        Some(Err(e)) => Err(map_read_error(e)),
        None => Err(NetworkError::ConnectionClosed),
    }
}

/// Read one control message
pub async fn read_message<S>(stream: &mut S) -> Result<ControlMessage, NetworkError>
where
    S: Stream<Item = io::Result<BytesMut>> + Unpin,
{
    read_json(stream).await
}

/// Send an already-encoded body and flush
pub async fn send_body<S>(sink: &mut S, body: Bytes) -> Result<(), NetworkError>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    sink.send(body).await.map_err(|e| {
        if is_disconnect(&e) {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::SendFailed(e.to_string())
        }
    })
}

/// Write one framed JSON value
pub async fn write_json<T, S>(sink: &mut S, value: &T) -> Result<(), NetworkError>
where
    T: Serialize,
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    send_body(sink, encode_json(value)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_body_layout() {
        let body = encode_message(&ControlMessage::SwitchToCs).unwrap();
        assert_eq!(&body[..], br#"{"type":"switch_to_cs"}"#);
        assert_eq!(decode_message(&body).unwrap(), ControlMessage::SwitchToCs);
        assert!(decode_message(b"{").is_err());
    }

    #[tokio::test]
    async fn test_wire_prefix_is_big_endian_length() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut client = control_transport(client, 1024);
        write_json(&mut client, &ControlMessage::SwitchToP2p).await.unwrap();

        let body = br#"{"type":"switch_to_p2p"}"#;
        let mut raw = vec![0u8; 4 + body.len()];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut raw).await.unwrap();
        assert_eq!(&raw[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&raw[4..], body);
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = control_transport(client, 1024);
        let mut server = control_transport(server, 1024);

        write_json(&mut client, &ControlMessage::init("c1")).await.unwrap();
        write_json(&mut client, &ControlMessage::text("hi", "alice", None)).await.unwrap();

        assert_eq!(read_message(&mut server).await.unwrap(), ControlMessage::init("c1"));
        assert_eq!(
            read_message(&mut server).await.unwrap(),
            ControlMessage::text("hi", "alice", None)
        );

        drop(client);
        assert!(matches!(
            read_message(&mut server).await,
            Err(NetworkError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalid_body_keeps_stream_in_sync() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = control_reader(server, 1024);

        client.write_u32(5).await.unwrap();
        client.write_all(b"nope!").await.unwrap();
        let mut writer = control_writer(client, 1024);
        write_json(&mut writer, &ControlMessage::SwitchToCs).await.unwrap();

        assert!(matches!(
            read_message(&mut server).await,
            Err(NetworkError::InvalidMessage(_))
        ));
        assert_eq!(read_message(&mut server).await.unwrap(), ControlMessage::SwitchToCs);
    }

    #[tokio::test]
    async fn test_oversized_message() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut server = control_reader(server, 1024);
        client.write_u32(1_000_000).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(NetworkError::MessageTooLarge)
        ));
    }
}
