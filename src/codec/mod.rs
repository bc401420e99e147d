//! Chunked datagram codec
//!
//! Pure framing for media datagrams shared by the video and audio
//! channels. Nothing here touches sockets or session state.

pub mod chunker;
pub mod packet;

pub use chunker::{chunk_frame, payload_capacity, signal_packet};
pub use packet::{ChunkedPacket, MediaDatagram, MediaSignal, CANCELLED};
