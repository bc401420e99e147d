//! Per-channel datagram router
//!
//! One router per media socket. Every received datagram is handled on its
//! own task: registration datagrams bind an address, chunks are fed to
//! reassembly, and completed frames are fanned out (video) or mixed and
//! returned to the sender (audio).

use bytes::Bytes;
use futures_util::future::join_all;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::codec::{chunk_frame, signal_packet, ChunkedPacket, MediaDatagram, MediaSignal};
use crate::constants::{MAX_RECV_DATAGRAM, MIX_SOURCE_ID};
use crate::error::{is_disconnect, SessionError};
use crate::media::mixer::pcm_to_bytes;
use crate::media::reassembly::ChunkOutcome;
use crate::protocol::MediaChannel;
use crate::session::{ConferenceSession, SessionState};

/// Router counters
#[derive(Debug, Default)]
struct RouterCounters {
    datagrams: AtomicU64,
    malformed: AtomicU64,
    unknown_senders: AtomicU64,
    frames_completed: AtomicU64,
    relayed: AtomicU64,
    send_failures: AtomicU64,
}

/// Snapshot of a router's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub datagrams: u64,
    pub malformed: u64,
    pub unknown_senders: u64,
    pub frames_completed: u64,
    pub relayed: u64,
    pub send_failures: u64,
}

/// Routes one media channel of one conference
pub struct MediaRouter {
    channel: MediaChannel,
    max_datagram: usize,
    counters: RouterCounters,
}

impl MediaRouter {
    pub fn new(channel: MediaChannel, max_datagram: usize) -> Self {
        Self {
            channel,
            max_datagram,
            counters: RouterCounters::default(),
        }
    }

    pub fn channel(&self) -> MediaChannel {
        self.channel
    }

    /// Receive until the session stops
    pub async fn run(self: Arc<Self>, session: Arc<ConferenceSession>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; MAX_RECV_DATAGRAM];
        let stopped = session.stopped();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, addr)) => {
                        let data = Bytes::copy_from_slice(&buf[..len]);
                        let router = Arc::clone(&self);
                        let session = Arc::clone(&session);
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            router.handle_datagram(&session, &socket, data, addr).await;
                        });
                    }
                    // ICMP unreachable from a departed peer surfaces here on some platforms
                    Err(e) if is_disconnect(&e) => {
                        debug!(channel = %self.channel, error = %e, "Peer unreachable");
                    }
                    Err(e) => {
                        warn!(channel = %self.channel, error = %e, "Media receive failed");
                    }
                }
            }
        }
        debug!(conference = session.id(), channel = %self.channel, "Media router stopped");
    }

    /// Handle one datagram; returns the number of datagrams sent
    pub async fn handle_datagram(
        &self,
        session: &ConferenceSession,
        socket: &UdpSocket,
        data: Bytes,
        addr: SocketAddr,
    ) -> usize {
        self.counters.datagrams.fetch_add(1, Ordering::Relaxed);
        if !session.is_running() {
            return 0;
        }

        let packet = match MediaDatagram::classify(data) {
            Ok(MediaDatagram::Init { client_id }) => {
                session.register_media(&client_id, self.channel, addr);
                return 0;
            }
            Ok(MediaDatagram::Cancelled) => {
                debug!(channel = %self.channel, %addr, "Ignoring teardown notice from client");
                return 0;
            }
            Ok(MediaDatagram::Packet(packet)) => packet,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(channel = %self.channel, %addr, error = %e, "Dropping malformed datagram");
                return 0;
            }
        };

        let (outgoing, membership_changed) = {
            let mut state = session.lock_state();
            self.route(&mut state, packet, addr)
        };
        if membership_changed {
            session.notify_membership();
        }
        if outgoing.is_empty() {
            return 0;
        }

        let results = join_all(outgoing.iter().map(|(datagram, peer)| socket.send_to(datagram, *peer))).await;

        let mut sent = 0;
        for (result, (_, peer)) in results.into_iter().zip(&outgoing) {
            match result {
                Ok(_) => sent += 1,
                Err(e) => {
                    self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(channel = %self.channel, %peer, error = %e, "Failed to relay datagram");
                }
            }
        }
        self.counters.relayed.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Feed one chunk under the session lock and collect what to send.
    /// The flag reports a membership change.
    fn route(
        &self,
        state: &mut SessionState,
        packet: ChunkedPacket,
        addr: SocketAddr,
    ) -> (Vec<(Bytes, SocketAddr)>, bool) {
        let mut outgoing = Vec::new();

        let Some(client_id) = state.client_for_addr(self.channel, addr) else {
            self.counters.unknown_senders.fetch_add(1, Ordering::Relaxed);
            debug!(
                channel = %self.channel,
                %addr,
                error = %SessionError::UnknownClient(packet.client_id),
                "Dropping chunk from unregistered address"
            );
            return (outgoing, false);
        };
        if packet.client_id != client_id {
            trace!(registered = %client_id, claimed = %packet.client_id, "Client id mismatch");
        }

        let timestamp = packet.timestamp;
        let outcome = state.reassembly(self.channel).on_chunk(
            &client_id,
            packet.sequence_number,
            packet.total_length,
            packet.payload,
        );

        match outcome {
            ChunkOutcome::Incomplete => {}
            ChunkOutcome::Left => {
                debug!(channel = %self.channel, client = %client_id, "Media stream terminated");
                self.relay_signal(state, &client_id, MediaSignal::Terminate, &mut outgoing);
                state.remove_media(self.channel, &client_id);
                return (outgoing, true);
            }
            ChunkOutcome::Paused => {
                debug!(channel = %self.channel, client = %client_id, "Media stream paused");
                self.relay_signal(state, &client_id, MediaSignal::Off, &mut outgoing);
            }
            ChunkOutcome::Frame(frame) => {
                self.counters.frames_completed.fetch_add(1, Ordering::Relaxed);
                if state.relay_paused {
                    trace!(channel = %self.channel, client = %client_id, "Relay paused, frame dropped");
                    return (outgoing, false);
                }
                match self.channel {
                    MediaChannel::Video => {
                        let peers = state.media_peers(MediaChannel::Video, &client_id);
                        if peers.is_empty() {
                            return (outgoing, false);
                        }
                        match chunk_frame(&client_id, &frame, self.max_datagram, timestamp) {
                            Ok(chunks) => {
                                for peer in peers {
                                    outgoing.extend(chunks.iter().map(|chunk| (chunk.clone(), peer)));
                                }
                            }
                            Err(e) => warn!(client = %client_id, error = %e, "Failed to re-chunk video frame"),
                        }
                    }
                    MediaChannel::Audio => {
                        if let Some(mix) = state.mixer.on_audio_chunk(addr, &frame) {
                            match chunk_frame(MIX_SOURCE_ID, &pcm_to_bytes(&mix), self.max_datagram, None) {
                                Ok(chunks) => outgoing.extend(chunks.into_iter().map(|chunk| (chunk, addr))),
                                Err(e) => warn!(error = %e, "Failed to chunk mixed audio"),
                            }
                        }
                    }
                }
            }
        }
        (outgoing, false)
    }

    /// Forward a stream signal to the other video receivers. Audio peers
    /// only ever receive the mix, so audio signals stay local.
    fn relay_signal(
        &self,
        state: &SessionState,
        client_id: &str,
        signal: MediaSignal,
        outgoing: &mut Vec<(Bytes, SocketAddr)>,
    ) {
        if self.channel != MediaChannel::Video || state.relay_paused {
            return;
        }
        match signal_packet(client_id, signal) {
            Ok(datagram) => outgoing.extend(
                state
                    .media_peers(MediaChannel::Video, client_id)
                    .into_iter()
                    .map(|peer| (datagram.clone(), peer)),
            ),
            Err(e) => warn!(client = %client_id, error = %e, "Failed to build signal datagram"),
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            datagrams: self.counters.datagrams.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            unknown_senders: self.counters.unknown_senders.load(Ordering::Relaxed),
            frames_completed: self.counters.frames_completed.load(Ordering::Relaxed),
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::{OFF, TERMINATE};
    use crate::config::{MediaConfig, SessionConfig};
    use crate::media::mixer::pcm_from_bytes;
    use crate::network::create_socket;
    use crate::protocol::ControlMessage;
    use std::time::Duration;

    fn udp() -> UdpSocket {
        create_socket("127.0.0.1:0".parse().unwrap(), 1 << 16, 1 << 16).unwrap()
    }

    async fn recv(socket: &UdpSocket) -> ChunkedPacket {
        let mut buf = vec![0u8; 2048];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("datagram expected")
            .unwrap();
        ChunkedPacket::decode(&Bytes::copy_from_slice(&buf[..len])).unwrap()
    }

    async fn nothing_arrives(socket: &UdpSocket) -> bool {
        let mut buf = vec![0u8; 2048];
        tokio::time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf))
            .await
            .is_err()
    }

    fn init(id: &str) -> Bytes {
        Bytes::from(serde_json::to_vec(&ControlMessage::init(id)).unwrap())
    }

    fn session() -> Arc<ConferenceSession> {
        ConferenceSession::new(1, "a", "test", &SessionConfig::default(), &MediaConfig::default())
    }

    #[tokio::test]
    async fn test_video_frame_fanout() {
        let session = session();
        let server = udp();
        let (a, b, c) = (udp(), udp(), udp());
        let router = MediaRouter::new(MediaChannel::Video, 1472);

        for (id, sock) in [("a", &a), ("b", &b), ("c", &c)] {
            router
                .handle_datagram(&session, &server, init(id), sock.local_addr().unwrap())
                .await;
        }
        assert_eq!(session.media_count(MediaChannel::Video), 3);

        let frame: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let chunks = chunk_frame("a", &frame, 1472, Some(1.5)).unwrap();
        assert_eq!(chunks.len(), 3);

        let a_addr = a.local_addr().unwrap();
        let mut sent = 0;
        for chunk in chunks.into_iter().rev() {
            sent += router.handle_datagram(&session, &server, chunk, a_addr).await;
        }
        assert_eq!(sent, 6);

        for peer in [&b, &c] {
            let mut rebuilt = Vec::new();
            for seq in 0..3u32 {
                let packet = recv(peer).await;
                assert_eq!(packet.client_id, "a");
                assert_eq!(packet.sequence_number, seq);
                assert_eq!(packet.total_length, 3000);
                assert_eq!(packet.timestamp, Some(1.5));
                rebuilt.extend_from_slice(&packet.payload);
            }
            assert_eq!(rebuilt, frame);
        }
        assert!(nothing_arrives(&a).await);
        assert_eq!(router.stats().frames_completed, 1);
    }

    #[tokio::test]
    async fn test_audio_mix_returns_to_sender() {
        let session = session();
        let server = udp();
        let (a, b) = (udp(), udp());
        let router = MediaRouter::new(MediaChannel::Audio, 1472);
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        router.handle_datagram(&session, &server, init("a"), a_addr).await;
        router.handle_datagram(&session, &server, init("b"), b_addr).await;

        let samples = MediaConfig::default().audio_chunk_samples;
        let tone = pcm_to_bytes(&vec![100i16; samples]);

        // b speaks: a's mix buffer collects it, b gets silence back
        for chunk in chunk_frame("b", &tone, 1472, None).unwrap() {
            router.handle_datagram(&session, &server, chunk, b_addr).await;
        }
        let mut silence = Vec::new();
        while silence.len() < samples * 2 {
            let packet = recv(&b).await;
            assert_eq!(packet.client_id, MIX_SOURCE_ID);
            silence.extend_from_slice(&packet.payload);
        }
        assert!(pcm_from_bytes(&silence, samples).iter().all(|s| *s == 0));

        // a speaks: a receives b's audio
        for chunk in chunk_frame("a", &tone, 1472, None).unwrap() {
            router.handle_datagram(&session, &server, chunk, a_addr).await;
        }
        let mut mixed = Vec::new();
        while mixed.len() < samples * 2 {
            mixed.extend_from_slice(&recv(&a).await.payload);
        }
        assert!(pcm_from_bytes(&mixed, samples).iter().all(|s| *s == 100));
    }

    #[tokio::test]
    async fn test_terminate_removes_and_off_keeps() {
        let session = session();
        let server = udp();
        let (a, b) = (udp(), udp());
        let router = MediaRouter::new(MediaChannel::Video, 1472);
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        router.handle_datagram(&session, &server, init("a"), a_addr).await;
        router.handle_datagram(&session, &server, init("b"), b_addr).await;

        let off = signal_packet("a", MediaSignal::Off).unwrap();
        assert_eq!(router.handle_datagram(&session, &server, off, a_addr).await, 1);
        assert_eq!(recv(&b).await.payload.as_ref(), OFF);
        assert_eq!(session.media_count(MediaChannel::Video), 2);

        let terminate = signal_packet("a", MediaSignal::Terminate).unwrap();
        assert_eq!(router.handle_datagram(&session, &server, terminate, a_addr).await, 1);
        assert_eq!(recv(&b).await.payload.as_ref(), TERMINATE);
        assert_eq!(session.media_count(MediaChannel::Video), 1);
    }

    #[tokio::test]
    async fn test_audio_terminate_drops_mix_buffer() {
        let session = session();
        let server = udp();
        let (a, b) = (udp(), udp());
        let router = MediaRouter::new(MediaChannel::Audio, 1472);
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        router.handle_datagram(&session, &server, init("a"), a_addr).await;
        router.handle_datagram(&session, &server, init("b"), b_addr).await;
        assert!(session.lock_state().mixer.contains(&b_addr));

        let terminate = signal_packet("b", MediaSignal::Terminate).unwrap();
        assert_eq!(router.handle_datagram(&session, &server, terminate, b_addr).await, 0);

        {
            let state = session.lock_state();
            assert!(!state.mixer.contains(&b_addr));
            assert!(state.mixer.contains(&a_addr));
        }
        assert_eq!(session.media_count(MediaChannel::Audio), 1);
        assert!(nothing_arrives(&a).await);
    }

    #[tokio::test]
    async fn test_unknown_sender_and_garbage_dropped() {
        let session = session();
        let server = udp();
        let stranger = udp();
        let router = MediaRouter::new(MediaChannel::Video, 1472);
        let addr = stranger.local_addr().unwrap();

        let chunk = chunk_frame("x", b"hello", 1472, None).unwrap().remove(0);
        assert_eq!(router.handle_datagram(&session, &server, chunk, addr).await, 0);
        assert_eq!(router.handle_datagram(&session, &server, Bytes::from_static(b"\x01"), addr).await, 0);

        let stats = router.stats();
        assert_eq!(stats.datagrams, 2);
        assert_eq!(stats.unknown_senders, 1);
        assert_eq!(stats.malformed, 1);
    }

    #[tokio::test]
    async fn test_paused_relay_drops_frames() {
        let session = session();
        let server = udp();
        let (a, b) = (udp(), udp());
        let router = MediaRouter::new(MediaChannel::Video, 1472);
        let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());

        router.handle_datagram(&session, &server, init("a"), a_addr).await;
        router.handle_datagram(&session, &server, init("b"), b_addr).await;
        session.lock_state().relay_paused = true;

        let chunk = chunk_frame("a", b"frame", 1472, None).unwrap().remove(0);
        assert_eq!(router.handle_datagram(&session, &server, chunk, a_addr).await, 0);
        assert_eq!(router.stats().frames_completed, 1);
        assert!(nothing_arrives(&b).await);
    }
}
