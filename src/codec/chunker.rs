//! Splits encoded frames into datagram-sized chunks

use bytes::Bytes;

use crate::codec::packet::{encode, header_size, MediaSignal};
use crate::error::CodecError;

/// Payload bytes that fit in one datagram for this sender
pub fn payload_capacity(client_id: &str, timestamped: bool, max_datagram: usize) -> Result<usize, CodecError> {
    let header = header_size(client_id.len(), timestamped);
    if max_datagram <= header {
        return Err(CodecError::DatagramTooSmall(max_datagram));
    }
    Ok(max_datagram - header)
}

/// Split one frame into chunks numbered from 0, each carrying the full
/// frame length. An empty frame still produces a single chunk.
pub fn chunk_frame(
    client_id: &str,
    frame: &[u8],
    max_datagram: usize,
    timestamp: Option<f64>,
) -> Result<Vec<Bytes>, CodecError> {
    let capacity = payload_capacity(client_id, timestamp.is_some(), max_datagram)?;
    let total_length = frame.len() as u64;

    if frame.is_empty() {
        return Ok(vec![encode(client_id, 0, 0, timestamp, &[])?]);
    }

    frame
        .chunks(capacity)
        .enumerate()
        .map(|(seq, chunk)| encode(client_id, total_length, seq as u32, timestamp, chunk))
        .collect()
}

/// Build a `TERMINATE` or `OFF` datagram
pub fn signal_packet(client_id: &str, signal: MediaSignal) -> Result<Bytes, CodecError> {
    encode(client_id, 0, 0, None, signal.as_bytes())
}
