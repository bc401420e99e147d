//! Per-listener PCM mixing
//!
//! Every audio-producing address owns one accumulation buffer. An inbound
//! chunk is added into every *other* buffer, then the sender's own buffer
//! (everyone else's contributions since its last chunk) is flushed back to
//! it and zeroed. The sender's voice never reaches its own mix.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Convert little-endian 16-bit PCM to exactly `samples` samples,
/// silence-padding short input and dropping excess bytes
pub fn pcm_from_bytes(chunk: &[u8], samples: usize) -> Vec<i16> {
    let mut pcm = vec![0i16; samples];
    for (slot, pair) in pcm.iter_mut().zip(chunk.chunks_exact(2)) {
        *slot = i16::from_le_bytes([pair[0], pair[1]]);
    }
    pcm
}

/// Serialize samples as little-endian 16-bit PCM
pub fn pcm_to_bytes(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.put_i16_le(*sample);
    }
    buf.freeze()
}

/// Mixer statistics
#[derive(Debug, Clone, Default)]
pub struct MixerStats {
    pub chunks_mixed: u64,
    pub mixes_flushed: u64,
    pub unknown_senders: u64,
}

/// Round-robin audio mixer keyed by sender address
pub struct AudioMixer {
    chunk_samples: usize,
    buffers: HashMap<SocketAddr, Vec<i16>>,
    stats: MixerStats,
}

impl AudioMixer {
    pub fn new(chunk_samples: usize) -> Self {
        Self {
            chunk_samples,
            buffers: HashMap::new(),
            stats: MixerStats::default(),
        }
    }

    /// Samples per mixed chunk
    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Start (or restart) mixing for an address with a silent buffer
    pub fn register(&mut self, addr: SocketAddr) {
        self.buffers.insert(addr, vec![0; self.chunk_samples]);
    }

    /// Stop mixing for an address
    pub fn deregister(&mut self, addr: &SocketAddr) -> bool {
        self.buffers.remove(addr).is_some()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.buffers.contains_key(addr)
    }

    /// Current accumulation for `addr`
    pub fn buffer(&self, addr: &SocketAddr) -> Option<&[i16]> {
        self.buffers.get(addr).map(|b| b.as_slice())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Mix a chunk from `from` into every other listener, then return and
    /// reset the mix destined for `from`. Returns `None` for unregistered
    /// senders.
    pub fn on_audio_chunk(&mut self, from: SocketAddr, chunk: &[u8]) -> Option<Vec<i16>> {
        if !self.buffers.contains_key(&from) {
            self.stats.unknown_senders += 1;
            return None;
        }

        let pcm = pcm_from_bytes(chunk, self.chunk_samples);
        for (addr, buffer) in self.buffers.iter_mut() {
            if *addr == from {
                continue;
            }
            for (acc, sample) in buffer.iter_mut().zip(&pcm) {
                *acc = acc.saturating_add(*sample);
            }
        }
        self.stats.chunks_mixed += 1;

        let silence = vec![0; self.chunk_samples];
        let mix = self.buffers.insert(from, silence);
        self.stats.mixes_flushed += 1;
        mix
    }

    pub fn stats(&self) -> MixerStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn tone(value: i16, samples: usize) -> Bytes {
        pcm_to_bytes(&vec![value; samples])
    }

    #[test]
    fn test_pcm_padding_and_truncation() {
        let short = pcm_from_bytes(&[1, 0, 2, 0], 4);
        assert_eq!(short, vec![1, 2, 0, 0]);

        let long = pcm_from_bytes(&[1, 0, 2, 0, 3, 0], 2);
        assert_eq!(long, vec![1, 2]);

        // Odd trailing byte is dropped
        let odd = pcm_from_bytes(&[0xff, 0x7f, 9], 2);
        assert_eq!(odd, vec![i16::MAX, 0]);
    }

    #[test]
    fn test_mix_excludes_sender() {
        let (a, b, c) = (addr(1), addr(2), addr(3));
        let mut mixer = AudioMixer::new(8);
        mixer.register(a);
        mixer.register(b);
        mixer.register(c);

        // B and C speak first, their chunks land in A's buffer
        let to_b = mixer.on_audio_chunk(b, &tone(100, 8)).unwrap();
        let to_c = mixer.on_audio_chunk(c, &tone(20, 8)).unwrap();
        let to_a = mixer.on_audio_chunk(a, &tone(5000, 8)).unwrap();

        assert_eq!(to_b, vec![0; 8]);
        assert_eq!(to_c, vec![100; 8]);
        assert_eq!(to_a, vec![120; 8]);

        // A's own chunk went to B and C only
        assert_eq!(mixer.buffer(&a).unwrap(), &[0; 8]);
        assert_eq!(mixer.buffer(&b).unwrap(), &[20 + 5000; 8]);
        assert_eq!(mixer.buffer(&c).unwrap(), &[5000; 8]);
    }

    #[test]
    fn test_saturation() {
        let (a, b, c) = (addr(1), addr(2), addr(3));
        let mut mixer = AudioMixer::new(4);
        mixer.register(a);
        mixer.register(b);
        mixer.register(c);

        mixer.on_audio_chunk(b, &tone(i16::MAX, 4));
        mixer.on_audio_chunk(c, &tone(i16::MAX, 4));
        assert_eq!(mixer.on_audio_chunk(a, &[]).unwrap(), vec![i16::MAX; 4]);

        mixer.on_audio_chunk(b, &tone(i16::MIN, 4));
        mixer.on_audio_chunk(c, &tone(i16::MIN, 4));
        assert_eq!(mixer.on_audio_chunk(a, &[]).unwrap(), vec![i16::MIN; 4]);
    }

    #[test]
    fn test_flush_resets_sender_buffer() {
        let (a, b) = (addr(1), addr(2));
        let mut mixer = AudioMixer::new(2);
        mixer.register(a);
        mixer.register(b);

        mixer.on_audio_chunk(b, &tone(7, 2));
        assert_eq!(mixer.on_audio_chunk(a, &[]).unwrap(), vec![7, 7]);
        assert_eq!(mixer.on_audio_chunk(a, &[]).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_register_resets_only_that_buffer() {
        let (a, b, c) = (addr(1), addr(2), addr(3));
        let mut mixer = AudioMixer::new(2);
        mixer.register(a);
        mixer.register(b);
        mixer.on_audio_chunk(a, &tone(9, 2));
        assert_eq!(mixer.buffer(&b).unwrap(), &[9, 9]);

        mixer.register(c);
        assert_eq!(mixer.buffer(&b).unwrap(), &[9, 9]);
        assert_eq!(mixer.buffer(&c).unwrap(), &[0, 0]);

        mixer.register(b);
        assert_eq!(mixer.buffer(&b).unwrap(), &[0, 0]);

        assert!(mixer.deregister(&c));
        assert!(!mixer.contains(&c));
        assert_eq!(mixer.len(), 2);
    }

    #[test]
    fn test_unknown_sender() {
        let mut mixer = AudioMixer::new(2);
        mixer.register(addr(1));
        assert!(mixer.on_audio_chunk(addr(9), &tone(1, 2)).is_none());
        assert_eq!(mixer.buffer(&addr(1)).unwrap(), &[0, 0]);
        assert_eq!(mixer.stats().unknown_senders, 1);
    }

    #[test]
    fn test_pcm_bytes_roundtrip() {
        let samples = vec![0, 1, -1, i16::MAX, i16::MIN];
        let bytes = pcm_to_bytes(&samples);
        assert_eq!(pcm_from_bytes(&bytes, samples.len()), samples);
    }
}
