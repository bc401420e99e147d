//! Server-side media handling
//!
//! Chunk reassembly per sender, audio mixing, and the per-channel routers
//! that tie both to a conference session.

pub mod mixer;
pub mod reassembly;
pub mod router;

pub use mixer::{pcm_from_bytes, pcm_to_bytes, AudioMixer, MixerStats};
pub use reassembly::{ChunkOutcome, FrameDecoder, PassthroughDecoder, ReassemblyBuffer, ReassemblyState, ReassemblyStats};
pub use router::{MediaRouter, RouterStats};
