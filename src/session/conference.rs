//! Conference session
//!
//! Owns one meeting: membership, per-channel address tables, the topology
//! state machine, the P2P handoff, and the media routers. All mutable
//! state sits behind a single mutex that is never held across an await.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::CANCELLED;
use crate::config::{MediaConfig, SessionConfig};
use crate::error::{Error, NetworkError, Result, SessionError};
use crate::media::{AudioMixer, MediaRouter, ReassemblyBuffer};
use crate::network::{create_socket, encode_message};
use crate::protocol::{ConferenceInfo, ControlMessage, DataPorts, MediaChannel, Mode, PeerAddrs};
use crate::session::client::{host_port, ClientSession, TextLink};
use crate::session::connection;
use crate::session::topology::{self, Transition};

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The manager quit or disconnected
    ManagerLeft,
    /// The manager cancelled the conference
    Cancelled,
    /// The registry removed the conference
    Destroyed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::ManagerLeft => f.write_str("manager left"),
            StopReason::Cancelled => f.write_str("cancelled"),
            StopReason::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// A P2P handoff waiting for both port announcements
#[derive(Debug, Clone)]
struct Handoff {
    generation: u64,
    participants: Vec<String>,
}

/// Everything guarded by the session mutex
pub(crate) struct SessionState {
    pub(crate) mode: Mode,
    pub(crate) clients: HashMap<String, ClientSession>,
    pub(crate) p2p_ports: HashMap<String, u16>,
    handoff: Option<Handoff>,
    handoff_generation: u64,
    /// Set once a handoff completes; media is then exchanged directly
    pub(crate) relay_paused: bool,
    pub(crate) video: ReassemblyBuffer,
    pub(crate) audio: ReassemblyBuffer,
    pub(crate) mixer: AudioMixer,
}

impl SessionState {
    fn new(audio_chunk_samples: usize) -> Self {
        Self {
            mode: Mode::ClientServer,
            clients: HashMap::new(),
            p2p_ports: HashMap::new(),
            handoff: None,
            handoff_generation: 0,
            relay_paused: false,
            video: ReassemblyBuffer::new(),
            audio: ReassemblyBuffer::new(),
            mixer: AudioMixer::new(audio_chunk_samples),
        }
    }

    /// Clients with a live control connection
    pub(crate) fn text_count(&self) -> usize {
        self.clients.values().filter(|c| c.text.is_some()).count()
    }

    pub(crate) fn media_count(&self, channel: MediaChannel) -> usize {
        self.clients.values().filter(|c| c.media(channel).is_some()).count()
    }

    /// Every text-connected client has registered on every media channel.
    /// Media-only entries have no say.
    fn is_converged(&self) -> bool {
        self.clients
            .values()
            .filter(|c| c.text.is_some())
            .all(|c| c.has_all_media())
    }

    /// Drop media-only entries that never got a control connection
    /// within `max_age`, returning their ids
    fn prune_orphans(&mut self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let orphans: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.text.is_none() && now.duration_since(c.registered_at) >= max_age)
            .map(|c| c.id.clone())
            .collect();
        for id in &orphans {
            self.remove_client(id);
        }
        orphans
    }

    pub(crate) fn client_for_addr(&self, channel: MediaChannel, addr: SocketAddr) -> Option<String> {
        self.clients
            .values()
            .find(|c| c.media(channel) == Some(addr))
            .map(|c| c.id.clone())
    }

    /// Media addresses of everyone but `except`
    pub(crate) fn media_peers(&self, channel: MediaChannel, except: &str) -> Vec<SocketAddr> {
        self.clients
            .values()
            .filter(|c| c.id != except)
            .filter_map(|c| c.media(channel))
            .collect()
    }

    pub(crate) fn reassembly(&mut self, channel: MediaChannel) -> &mut ReassemblyBuffer {
        match channel {
            MediaChannel::Video => &mut self.video,
            MediaChannel::Audio => &mut self.audio,
        }
    }

    fn participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .values()
            .filter(|c| c.text.is_some())
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Encode once, queue to every control connection except `except`
    fn broadcast(&self, msg: &ControlMessage, except: Option<Uuid>) -> usize {
        let frame = match encode_message(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = msg.kind(), error = %e, "Failed to encode broadcast");
                return 0;
            }
        };

        let mut delivered = 0;
        for client in self.clients.values() {
            let Some(link) = &client.text else { continue };
            if Some(link.conn_id) == except {
                continue;
            }
            if link.send_frame(frame.clone()) {
                delivered += 1;
            } else {
                debug!(client = %client.id, "Control writer gone, skipping");
            }
        }
        delivered
    }

    /// Unregister one channel of a client
    pub(crate) fn remove_media(&mut self, channel: MediaChannel, client_id: &str) -> Option<SocketAddr> {
        let client = self.clients.get_mut(client_id)?;
        let previous = client.set_media(channel, None);
        let now_empty = client.is_empty();

        if let (MediaChannel::Audio, Some(addr)) = (channel, previous) {
            self.mixer.deregister(&addr);
        }
        self.reassembly(channel).remove_client(client_id);
        if now_empty {
            self.clients.remove(client_id);
        }
        previous
    }

    fn remove_client(&mut self, client_id: &str) -> Option<ClientSession> {
        let client = self.clients.remove(client_id)?;
        if let Some(addr) = client.audio {
            self.mixer.deregister(&addr);
        }
        self.video.remove_client(client_id);
        self.audio.remove_client(client_id);
        self.p2p_ports.remove(client_id);
        if self
            .handoff
            .as_ref()
            .is_some_and(|h| h.participants.iter().any(|p| p == client_id))
        {
            self.handoff = None;
        }
        Some(client)
    }

    fn reset_to_client_server(&mut self) {
        self.mode = Mode::ClientServer;
        self.p2p_ports.clear();
        self.handoff = None;
        self.relay_paused = false;
    }

    fn begin_handoff(&mut self) -> u64 {
        self.mode = Mode::PeerToPeer;
        self.p2p_ports.clear();
        self.relay_paused = false;
        self.handoff_generation += 1;
        self.handoff = Some(Handoff {
            generation: self.handoff_generation,
            participants: self.participants(),
        });
        self.handoff_generation
    }

    /// Direct-traffic addresses a peer announced, or `None` if any
    /// channel is missing
    fn peer_addrs(&self, client_id: &str) -> Option<PeerAddrs> {
        let client = self.clients.get(client_id)?;
        let text = client.text.as_ref()?;
        let port = *self.p2p_ports.get(client_id)?;
        Some(PeerAddrs {
            text: (text.addr.ip().to_string(), port),
            video: host_port(client.video?),
            audio: host_port(client.audio?),
        })
    }
}

/// Bound listeners of a started session
struct Listeners {
    video: Arc<UdpSocket>,
    audio: Arc<UdpSocket>,
}

impl Listeners {
    fn socket(&self, channel: MediaChannel) -> &UdpSocket {
        match channel {
            MediaChannel::Video => &self.video,
            MediaChannel::Audio => &self.audio,
        }
    }
}

/// One running conference
pub struct ConferenceSession {
    id: u32,
    name: String,
    manager_id: String,
    created_at: DateTime<Utc>,
    config: SessionConfig,
    media_config: MediaConfig,
    state: Mutex<SessionState>,
    membership: Notify,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    ports: OnceLock<(u16, DataPorts)>,
    listeners: Mutex<Option<Listeners>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    video_router: Arc<MediaRouter>,
    audio_router: Arc<MediaRouter>,
}

impl ConferenceSession {
    /// Create a session without binding any listener
    pub fn new(
        id: u32,
        manager_id: impl Into<String>,
        name: impl Into<String>,
        config: &SessionConfig,
        media_config: &MediaConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            name: name.into(),
            manager_id: manager_id.into(),
            created_at: Utc::now(),
            config: config.clone(),
            media_config: media_config.clone(),
            state: Mutex::new(SessionState::new(media_config.audio_chunk_samples)),
            membership: Notify::new(),
            running: AtomicBool::new(true),
            shutdown_tx,
            ports: OnceLock::new(),
            listeners: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            video_router: Arc::new(MediaRouter::new(MediaChannel::Video, media_config.max_datagram_size)),
            audio_router: Arc::new(MediaRouter::new(MediaChannel::Audio, media_config.max_datagram_size)),
        })
    }

    /// Bind the control and media listeners on OS-assigned ports and
    /// spawn the accept loop, both media routers and the liveness logger
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.ports.get().is_some() {
            return Ok(());
        }

        let ip: IpAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|e| Error::Config(format!("bind address {}: {}", self.config.bind_address, e)))?;
        let any_port = SocketAddr::new(ip, 0);

        let control = TcpListener::bind(any_port)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("control listener: {}", e)))?;
        let video = Arc::new(create_socket(
            any_port,
            self.media_config.recv_buffer_size,
            self.media_config.send_buffer_size,
        )?);
        let audio = Arc::new(create_socket(
            any_port,
            self.media_config.recv_buffer_size,
            self.media_config.send_buffer_size,
        )?);

        let control_port = control.local_addr()?.port();
        let data_ports = DataPorts {
            video: video.local_addr()?.port(),
            audio: audio.local_addr()?.port(),
        };
        let _ = self.ports.set((control_port, data_ports));
        *self.listeners.lock() = Some(Listeners {
            video: Arc::clone(&video),
            audio: Arc::clone(&audio),
        });

        let handles = vec![
            tokio::spawn(connection::accept_loop(Arc::clone(self), control)),
            tokio::spawn(Arc::clone(&self.video_router).run(Arc::clone(self), video)),
            tokio::spawn(Arc::clone(&self.audio_router).run(Arc::clone(self), audio)),
            tokio::spawn(Arc::clone(self).log_loop()),
        ];
        self.tasks.lock().extend(handles);

        info!(
            conference = self.id,
            control_port,
            video_port = data_ports.video,
            audio_port = data_ports.audio,
            "Conference started"
        );
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager_id(&self) -> &str {
        &self.manager_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().mode
    }

    /// Control port and media ports; zero before `start`
    pub fn ports(&self) -> (u16, DataPorts) {
        self.ports
            .get()
            .copied()
            .unwrap_or((0, DataPorts { video: 0, audio: 0 }))
    }

    /// Ids of the text-connected clients, sorted
    pub fn participants(&self) -> Vec<String> {
        self.state.lock().participants()
    }

    /// Registered address count per media channel
    pub fn media_count(&self, channel: MediaChannel) -> usize {
        self.state.lock().media_count(channel)
    }

    /// Ports announced during the current handoff
    pub fn p2p_ports(&self) -> HashMap<String, u16> {
        self.state.lock().p2p_ports.clone()
    }

    /// Whether media relaying is paused for a completed P2P handoff
    pub fn relay_paused(&self) -> bool {
        self.state.lock().relay_paused
    }

    pub fn video_router(&self) -> &Arc<MediaRouter> {
        &self.video_router
    }

    pub fn audio_router(&self) -> &Arc<MediaRouter> {
        &self.audio_router
    }

    pub fn info(&self) -> ConferenceInfo {
        let (control_port, data_ports) = self.ports();
        let state = self.state.lock();
        ConferenceInfo {
            conference_id: self.id,
            conference_name: self.name.clone(),
            manager_id: self.manager_id.clone(),
            mode: state.mode,
            participants: state.participants(),
            control_port,
            data_ports,
            created_at: self.created_at,
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub(crate) fn notify_membership(&self) {
        self.membership.notify_waiters();
    }

    pub(crate) fn session_config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolves once the session has stopped
    pub fn stopped(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_tx.subscribe();
        async move {
            let _ = rx.wait_for(|stopped| *stopped).await;
        }
    }

    /// Bind a client id to a control connection
    pub fn register_text(&self, client_id: &str, link: TextLink) {
        {
            let mut state = self.state.lock();
            let client = state
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientSession::new(client_id));
            if let Some(old) = client.text.replace(link) {
                debug!(conference = self.id, client = %client_id, old_conn = %old.conn_id, "Control connection replaced");
            }
        }
        info!(conference = self.id, client = %client_id, "Client joined");
        self.notify_membership();
    }

    /// Bind a client id to a media address. Re-registering resets only
    /// that client's mix buffer.
    pub fn register_media(&self, client_id: &str, channel: MediaChannel, addr: SocketAddr) {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let client = state
                .clients
                .entry(client_id.to_string())
                .or_insert_with(|| ClientSession::new(client_id));
            let previous = client.set_media(channel, Some(addr));

            if channel == MediaChannel::Audio {
                if let Some(prev) = previous.filter(|prev| *prev != addr) {
                    state.mixer.deregister(&prev);
                }
                state.mixer.register(addr);
            }
        }
        info!(conference = self.id, client = %client_id, %channel, %addr, "Media address registered");
        self.notify_membership();
    }

    /// Remove a client from every table
    pub fn remove_client(&self, client_id: &str) -> Option<ClientSession> {
        let removed = self.state.lock().remove_client(client_id);
        if removed.is_some() {
            self.notify_membership();
        }
        removed
    }

    /// Relay a chat line to every connection except the sender's
    pub fn broadcast_text(&self, sender: Uuid, msg: &ControlMessage) -> usize {
        self.state.lock().broadcast(msg, Some(sender))
    }

    /// Recompute the topology once every media table has caught up with
    /// the text table. Waits at most `barrier_timeout`; a stopped session
    /// abandons the switch.
    pub async fn switch_mode(self: &Arc<Self>) -> Mode {
        let deadline = Instant::now() + self.config.barrier_timeout();
        let stopped = self.stopped();
        tokio::pin!(stopped);

        let converged = loop {
            let notified = self.membership.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_running() {
                return self.mode();
            }
            let converged = self.state.lock().is_converged();
            if converged {
                break true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => break false,
                _ = &mut stopped => return self.mode(),
            }
        };

        self.apply_topology(converged)
    }

    fn apply_topology(self: &Arc<Self>, converged: bool) -> Mode {
        let (mode, handoff) = {
            let mut state = self.state.lock();
            self.log_pruned(state.prune_orphans(self.config.barrier_timeout()));
            let current = state.mode;
            let participants = state.text_count();
            let mut transition = topology::plan(current, participants);

            if !converged {
                warn!(
                    conference = self.id,
                    participants,
                    video = state.media_count(MediaChannel::Video),
                    audio = state.media_count(MediaChannel::Audio),
                    "Address tables did not converge, deciding on text membership"
                );
                if transition == Transition::PeerToPeer {
                    transition = Transition::Stay;
                }
            }

            let handoff = match transition {
                Transition::Stay => None,
                Transition::Solo | Transition::ClientServer => {
                    state.reset_to_client_server();
                    None
                }
                Transition::PeerToPeer => Some(state.begin_handoff()),
            };

            if let Some(notice) = transition.notice() {
                state.broadcast(&notice, None);
                info!(
                    conference = self.id,
                    from = %current,
                    to = %transition.target_mode(current),
                    participants,
                    "Topology switched"
                );
            }
            (state.mode, handoff)
        };

        if let Some(generation) = handoff {
            let session = Arc::clone(self);
            let timeout = self.config.handoff_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Err(e) = session.expire_handoff(generation) {
                    warn!(conference = session.id, error = %e, "Falling back to Client-Server");
                }
            });
        }
        mode
    }

    /// Record a client's announced P2P port. Returns true when this
    /// completed the handoff and both peers were sent each other's
    /// addresses.
    pub fn on_p2p_info(&self, client_id: &str, port: u16) -> std::result::Result<bool, SessionError> {
        let mut state = self.state.lock();
        let Some(handoff) = state.handoff.clone() else {
            debug!(conference = self.id, client = %client_id, "P2P info outside a handoff, ignoring");
            return Ok(false);
        };
        if !handoff.participants.iter().any(|p| p == client_id) {
            return Err(SessionError::UnknownClient(client_id.to_string()));
        }

        state.p2p_ports.insert(client_id.to_string(), port);
        if !handoff.participants.iter().all(|p| state.p2p_ports.contains_key(p)) {
            return Ok(false);
        }

        let resolved: Option<Vec<PeerAddrs>> =
            handoff.participants.iter().map(|p| state.peer_addrs(p)).collect();
        let Some(resolved) = resolved else {
            warn!(conference = self.id, "Peer addresses incomplete, aborting handoff");
            state.reset_to_client_server();
            state.broadcast(&ControlMessage::SwitchToCs, None);
            return Ok(false);
        };

        // Each participant receives the other's addresses
        for (addrs, other) in resolved.into_iter().zip(handoff.participants.iter().rev()) {
            if let Some(link) = state.clients.get(other).and_then(|c| c.text.as_ref()) {
                link.send(&ControlMessage::peer_info(addrs));
            }
        }
        state.handoff = None;
        state.relay_paused = true;
        info!(conference = self.id, peers = ?handoff.participants, "P2P handoff complete");
        Ok(true)
    }

    /// Abandon handoff `generation` if it is still pending
    pub(crate) fn expire_handoff(&self, generation: u64) -> std::result::Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }
        let mut state = self.state.lock();
        match &state.handoff {
            Some(h) if h.generation == generation => {}
            _ => return Ok(()),
        }
        state.reset_to_client_server();
        state.broadcast(&ControlMessage::SwitchToCs, None);
        Err(SessionError::HandoffTimeout(self.id))
    }

    /// Cleanup after a control connection ends. The manager leaving stops
    /// the conference; anyone else leaving re-runs the topology switch.
    pub async fn on_connection_closed(self: &Arc<Self>, client_id: Option<&str>, conn_id: Uuid) {
        let Some(client_id) = client_id else { return };

        let removed = {
            let mut state = self.state.lock();
            let owns_link = state
                .clients
                .get(client_id)
                .and_then(|c| c.text.as_ref())
                .is_some_and(|link| link.conn_id == conn_id);
            if owns_link {
                state.remove_client(client_id)
            } else {
                None
            }
        };
        if removed.is_none() {
            return;
        }
        self.notify_membership();

        if !self.is_running() {
            return;
        }
        if client_id == self.manager_id {
            info!(
                conference = self.id,
                event = %SessionError::ManagerLeftConference(self.id),
                "Manager left, tearing down"
            );
            self.stop(StopReason::ManagerLeft);
        } else {
            info!(conference = self.id, client = %client_id, "Client left");
            self.switch_mode().await;
        }
    }

    /// End the conference on behalf of `requester`; only the manager may
    pub fn cancel_conference(&self, requester: &str) -> std::result::Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotRunning(self.id));
        }
        if requester != self.manager_id {
            return Err(SessionError::NotManager {
                conference_id: self.id,
                requester: requester.to_string(),
            });
        }
        self.stop(StopReason::Cancelled);
        Ok(())
    }

    /// Tear the conference down: notify every connection and socket,
    /// clear all per-client state, close listeners and cancel tasks.
    /// Returns false if it was already stopped.
    pub fn stop(&self, reason: StopReason) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let clients: Vec<ClientSession> = {
            let mut state = self.state.lock();
            let clients = state.clients.drain().map(|(_, c)| c).collect();
            state.reset_to_client_server();
            state.video.clear();
            state.audio.clear();
            state.mixer.clear();
            clients
        };

        for client in &clients {
            if let Some(link) = &client.text {
                link.send_cancelled();
            }
        }

        if let Some(listeners) = self.listeners.lock().take() {
            for client in &clients {
                for (channel, addr) in client.media_addrs() {
                    if let Err(e) = listeners.socket(channel).try_send_to(CANCELLED, addr) {
                        debug!(conference = self.id, %addr, error = %e, "Cancelled notice not sent");
                    }
                }
            }
        }

        self.shutdown_tx.send_replace(true);
        self.notify_membership();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        info!(conference = self.id, %reason, clients = clients.len(), "Conference stopped");
        true
    }

    fn log_pruned(&self, orphans: Vec<String>) {
        for client in orphans {
            warn!(conference = self.id, %client, "Media registration without a control connection expired");
        }
    }

    async fn log_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.log_interval());
        let stopped = self.stopped();
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (mode, participants) = {
                        let mut state = self.state.lock();
                        self.log_pruned(state.prune_orphans(self.config.barrier_timeout()));
                        (state.mode, state.participants())
                    };
                    let video = self.video_router.stats();
                    let audio = self.audio_router.stats();
                    info!(
                        conference = self.id,
                        %mode,
                        ?participants,
                        video_datagrams = video.datagrams,
                        video_frames = video.frames_completed,
                        audio_datagrams = audio.datagrams,
                        audio_frames = audio.frames_completed,
                        "Conference running"
                    );
                }
                _ = &mut stopped => break,
            }
        }
    }
}
