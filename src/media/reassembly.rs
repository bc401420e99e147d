//! Per-client frame reassembly
//!
//! UDP gives no ordering guarantee, so chunks of a frame are parked by
//! sequence number and drained strictly in order. Sequence numbers are
//! frame-local: every frame counts its chunks from 0 again.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;

use crate::codec::{ChunkedPacket, MediaSignal};
use crate::error::CodecError;

/// Channel-specific consumer of completed frames
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<(), CodecError>;
}

/// Decoder that accepts every frame unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughDecoder;

impl FrameDecoder for PassthroughDecoder {
    fn decode(&mut self, _frame: &[u8]) -> Result<(), CodecError> {
        Ok(())
    }
}

/// Reassembly progress of one client's current frame
#[derive(Debug, Default)]
pub struct ReassemblyState {
    expected_sequence: u32,
    pending: HashMap<u32, Bytes>,
    accumulated: BytesMut,
    declared_length: u64,
}

impl ReassemblyState {
    /// Add a chunk; returns the frame once `declared_length` bytes are in
    pub fn push(&mut self, sequence_number: u32, declared_length: u64, chunk: Bytes) -> Option<Bytes> {
        self.declared_length = declared_length;

        // Already drained into this frame
        if sequence_number >= self.expected_sequence {
            self.pending.insert(sequence_number, chunk);
        }

        while let Some(next) = self.pending.remove(&self.expected_sequence) {
            self.accumulated.extend_from_slice(&next);
            self.expected_sequence += 1;
        }

        if (self.accumulated.len() as u64) < self.declared_length {
            return None;
        }

        let frame = self.accumulated.split().freeze();
        self.expected_sequence = 0;
        self.declared_length = 0;
        Some(frame)
    }

    pub fn expected_sequence(&self) -> u32 {
        self.expected_sequence
    }

    pub fn accumulated_len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Result of feeding one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks needed
    Incomplete,
    /// A whole frame is ready
    Frame(Bytes),
    /// Sender paused the stream; its decode state was dropped
    Paused,
    /// Sender left; all of its state was dropped
    Left,
}

struct ClientStream<D> {
    state: ReassemblyState,
    decoder: D,
}

/// Reassembly statistics
#[derive(Debug, Clone, Default)]
pub struct ReassemblyStats {
    pub chunks_received: u64,
    pub frames_completed: u64,
    pub decode_errors: u64,
    pub clients_left: u64,
}

/// Chunk accumulator for every client of one media channel
pub struct ReassemblyBuffer<D: FrameDecoder = PassthroughDecoder> {
    streams: HashMap<String, ClientStream<D>>,
    make_decoder: Box<dyn Fn(&str) -> D + Send + Sync>,
    stats: ReassemblyStats,
}

impl ReassemblyBuffer<PassthroughDecoder> {
    pub fn new() -> Self {
        Self::with_decoder(|_| PassthroughDecoder)
    }
}

impl Default for ReassemblyBuffer<PassthroughDecoder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: FrameDecoder> ReassemblyBuffer<D> {
    /// Create a buffer that builds one decoder per client on first chunk
    pub fn with_decoder(make_decoder: impl Fn(&str) -> D + Send + Sync + 'static) -> Self {
        Self {
            streams: HashMap::new(),
            make_decoder: Box::new(make_decoder),
            stats: ReassemblyStats::default(),
        }
    }

    /// Feed one chunk of `client_id`'s current frame
    pub fn on_chunk(
        &mut self,
        client_id: &str,
        sequence_number: u32,
        declared_length: u64,
        chunk: Bytes,
    ) -> ChunkOutcome {
        match MediaSignal::from_payload(&chunk) {
            Some(MediaSignal::Terminate) => {
                self.remove_client(client_id);
                self.stats.clients_left += 1;
                return ChunkOutcome::Left;
            }
            Some(MediaSignal::Off) => {
                self.remove_client(client_id);
                return ChunkOutcome::Paused;
            }
            None => {}
        }

        self.stats.chunks_received += 1;

        if !self.streams.contains_key(client_id) {
            tracing::debug!(client = %client_id, "New media stream");
            let decoder = (self.make_decoder)(client_id);
            self.streams.insert(
                client_id.to_string(),
                ClientStream { state: ReassemblyState::default(), decoder },
            );
        }
        let Some(stream) = self.streams.get_mut(client_id) else {
            return ChunkOutcome::Incomplete;
        };

        match stream.state.push(sequence_number, declared_length, chunk) {
            Some(frame) => {
                self.stats.frames_completed += 1;
                if let Err(e) = stream.decoder.decode(&frame) {
                    self.stats.decode_errors += 1;
                    tracing::warn!(client = %client_id, error = %e, "Error decoding frame");
                }
                ChunkOutcome::Frame(frame)
            }
            None => ChunkOutcome::Incomplete,
        }
    }

    /// Feed a decoded packet
    pub fn on_packet(&mut self, packet: ChunkedPacket) -> ChunkOutcome {
        self.on_chunk(
            &packet.client_id,
            packet.sequence_number,
            packet.total_length,
            packet.payload,
        )
    }

    /// Drop everything held for a client
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        self.streams.remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.streams.contains_key(client_id)
    }

    pub fn state(&self, client_id: &str) -> Option<&ReassemblyState> {
        self.streams.get(client_id).map(|s| &s.state)
    }

    pub fn decoder(&self, client_id: &str) -> Option<&D> {
        self.streams.get(client_id).map(|s| &s.decoder)
    }

    /// Number of clients with an active stream
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::{OFF, TERMINATE};
    use proptest::prelude::*;

    fn chunks_of(frame: &[u8], size: usize) -> Vec<Bytes> {
        frame.chunks(size).map(Bytes::copy_from_slice).collect()
    }

    #[derive(Default)]
    struct RecordingDecoder {
        frames: Vec<Vec<u8>>,
    }

    impl FrameDecoder for RecordingDecoder {
        fn decode(&mut self, frame: &[u8]) -> Result<(), CodecError> {
            if frame == b"bad" {
                return Err(CodecError::DecodingFailed("bad frame".into()));
            }
            self.frames.push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_in_order() {
        let mut buffer = ReassemblyBuffer::new();
        let chunks = chunks_of(b"hello world", 4);

        assert_eq!(buffer.on_chunk("a", 0, 11, chunks[0].clone()), ChunkOutcome::Incomplete);
        assert_eq!(buffer.on_chunk("a", 1, 11, chunks[1].clone()), ChunkOutcome::Incomplete);
        assert_eq!(
            buffer.on_chunk("a", 2, 11, chunks[2].clone()),
            ChunkOutcome::Frame(Bytes::from_static(b"hello world"))
        );

        let state = buffer.state("a").unwrap();
        assert_eq!(state.expected_sequence(), 0);
        assert_eq!(state.accumulated_len(), 0);
    }

    #[test]
    fn test_out_of_order() {
        let mut buffer = ReassemblyBuffer::new();
        let chunks = chunks_of(b"abcdefgh", 3);

        assert_eq!(buffer.on_chunk("a", 2, 8, chunks[2].clone()), ChunkOutcome::Incomplete);
        assert_eq!(buffer.state("a").unwrap().pending_len(), 1);
        assert_eq!(buffer.on_chunk("a", 1, 8, chunks[1].clone()), ChunkOutcome::Incomplete);
        assert_eq!(buffer.state("a").unwrap().accumulated_len(), 0);
        assert_eq!(
            buffer.on_chunk("a", 0, 8, chunks[0].clone()),
            ChunkOutcome::Frame(Bytes::from_static(b"abcdefgh"))
        );
    }

    #[test]
    fn test_back_to_back_frames_restart_at_zero() {
        let mut buffer = ReassemblyBuffer::new();

        assert_eq!(buffer.on_chunk("a", 0, 4, Bytes::from_static(b"ab")), ChunkOutcome::Incomplete);
        assert!(matches!(buffer.on_chunk("a", 1, 4, Bytes::from_static(b"cd")), ChunkOutcome::Frame(_)));

        assert_eq!(buffer.on_chunk("a", 0, 4, Bytes::from_static(b"wx")), ChunkOutcome::Incomplete);
        assert_eq!(
            buffer.on_chunk("a", 1, 4, Bytes::from_static(b"yz")),
            ChunkOutcome::Frame(Bytes::from_static(b"wxyz"))
        );
        assert_eq!(buffer.stats().frames_completed, 2);
    }

    #[test]
    fn test_clients_are_independent() {
        let mut buffer = ReassemblyBuffer::new();

        buffer.on_chunk("a", 0, 4, Bytes::from_static(b"aa"));
        buffer.on_chunk("b", 0, 4, Bytes::from_static(b"bb"));
        assert_eq!(
            buffer.on_chunk("b", 1, 4, Bytes::from_static(b"BB")),
            ChunkOutcome::Frame(Bytes::from_static(b"bbBB"))
        );
        assert_eq!(
            buffer.on_chunk("a", 1, 4, Bytes::from_static(b"AA")),
            ChunkOutcome::Frame(Bytes::from_static(b"aaAA"))
        );
    }

    #[test]
    fn test_terminate_purges_partial_frame() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.on_chunk("a", 0, 10, Bytes::from_static(b"abc"));
        buffer.on_chunk("a", 3, 10, Bytes::from_static(b"xyz"));

        assert_eq!(buffer.on_chunk("a", 0, 0, Bytes::from_static(TERMINATE)), ChunkOutcome::Left);
        assert!(!buffer.contains("a"));
        assert_eq!(buffer.stats().clients_left, 1);
    }

    #[test]
    fn test_off_resets_decoder() {
        let mut buffer = ReassemblyBuffer::with_decoder(|_| RecordingDecoder::default());
        buffer.on_chunk("a", 0, 2, Bytes::from_static(b"f1"));
        assert_eq!(buffer.decoder("a").unwrap().frames.len(), 1);

        assert_eq!(buffer.on_chunk("a", 0, 0, Bytes::from_static(OFF)), ChunkOutcome::Paused);
        assert!(buffer.decoder("a").is_none());

        buffer.on_chunk("a", 0, 2, Bytes::from_static(b"f2"));
        assert_eq!(buffer.decoder("a").unwrap().frames, vec![b"f2".to_vec()]);
    }

    #[test]
    fn test_decode_error_does_not_block_reassembly() {
        let mut buffer = ReassemblyBuffer::with_decoder(|_| RecordingDecoder::default());
        assert!(matches!(buffer.on_chunk("a", 0, 3, Bytes::from_static(b"bad")), ChunkOutcome::Frame(_)));
        assert!(matches!(buffer.on_chunk("a", 0, 2, Bytes::from_static(b"ok")), ChunkOutcome::Frame(_)));

        let stats = buffer.stats();
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.frames_completed, 2);
    }

    #[test]
    fn test_on_packet() {
        let mut buffer = ReassemblyBuffer::new();
        let packet = ChunkedPacket::new("a", 3, 0, Bytes::from_static(b"abc"));
        assert_eq!(buffer.on_packet(packet), ChunkOutcome::Frame(Bytes::from_static(b"abc")));
    }

    fn frame_and_order() -> impl Strategy<Value = (Vec<u8>, usize, Vec<usize>)> {
        (proptest::collection::vec(any::<u8>(), 1..600), 1usize..64).prop_flat_map(|(frame, size)| {
            let count = (frame.len() + size - 1) / size;
            let order: Vec<usize> = (0..count).collect();
            (Just(frame), Just(size), Just(order).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn prop_any_permutation_reassembles_once((frame, size, order) in frame_and_order()) {
            let mut buffer = ReassemblyBuffer::new();
            let chunks = chunks_of(&frame, size);
            let mut emitted = Vec::new();

            for idx in order {
                if let ChunkOutcome::Frame(f) = buffer.on_chunk("c", idx as u32, frame.len() as u64, chunks[idx].clone()) {
                    emitted.push(f);
                }
            }

            prop_assert_eq!(emitted.len(), 1);
            prop_assert_eq!(emitted[0].as_ref(), frame.as_slice());
        }

        #[test]
        fn prop_duplicates_do_not_grow_frame(
            (frame, size, order) in frame_and_order(),
            dup_seed in any::<usize>(),
        ) {
            let mut buffer = ReassemblyBuffer::new();
            let chunks = chunks_of(&frame, size);
            let last = order.len() - 1;
            let mut emitted = Vec::new();

            for (pos, &idx) in order.iter().enumerate() {
                if pos == last && last > 0 {
                    // Re-deliver an earlier chunk before the frame can complete
                    let dup = order[dup_seed % last];
                    if let ChunkOutcome::Frame(f) = buffer.on_chunk("c", dup as u32, frame.len() as u64, chunks[dup].clone()) {
                        emitted.push(f);
                    }
                }
                if let ChunkOutcome::Frame(f) = buffer.on_chunk("c", idx as u32, frame.len() as u64, chunks[idx].clone()) {
                    emitted.push(f);
                }
            }

            prop_assert_eq!(emitted.len(), 1);
            prop_assert_eq!(emitted[0].as_ref(), frame.as_slice());
        }
    }
}
