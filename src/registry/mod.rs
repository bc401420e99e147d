//! Conference registry
//!
//! Creates, looks up and destroys conference sessions. Each session binds
//! its own listeners; the registry only hands out ids and ports.

pub mod server;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::constants::{CONFERENCE_ID_MAX, CONFERENCE_ID_MIN};
use crate::error::{Error, RegistryError, Result};
use crate::protocol::{ConferenceInfo, DataPorts, RegistryRequest, RegistryResponse};
use crate::session::{ConferenceSession, StopReason};

pub use server::RegistryServer;

/// Random draws before falling back to a scan of the id range
const RANDOM_ID_ATTEMPTS: usize = 32;

/// What a client needs to reach a newly created or joined conference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub conference_id: u32,
    pub control_port: u16,
    pub data_ports: DataPorts,
}

impl SessionHandle {
    fn of(session: &ConferenceSession) -> Self {
        let (control_port, data_ports) = session.ports();
        Self {
            conference_id: session.id(),
            control_port,
            data_ports,
        }
    }

    fn into_response(self) -> RegistryResponse {
        RegistryResponse {
            conference_id: Some(self.conference_id),
            conference_serve_port: Some(self.control_port),
            data_serve_ports: Some(self.data_ports),
            ..RegistryResponse::success()
        }
    }
}

/// Live conferences keyed by id
pub struct Registry {
    config: AppConfig,
    sessions: DashMap<u32, Arc<ConferenceSession>>,
    started_at: DateTime<Utc>,
}

impl Registry {
    pub fn new(config: AppConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Create and start a session managed by `manager_id`
    pub async fn create_session(&self, manager_id: &str, name: Option<String>) -> Result<SessionHandle> {
        self.prune();
        let session = self.reserve(manager_id, name)?;
        let id = session.id();

        if let Err(e) = session.start().await {
            self.sessions.remove(&id);
            session.stop(StopReason::Destroyed);
            return Err(e);
        }

        let handle = SessionHandle::of(&session);
        info!(
            conference = id,
            manager = %manager_id,
            control_port = handle.control_port,
            "Conference created"
        );
        Ok(handle)
    }

    /// Pick a free id and insert an unstarted session under it
    fn reserve(&self, manager_id: &str, name: Option<String>) -> Result<Arc<ConferenceSession>> {
        let mut rng = rand::thread_rng();
        let candidates = (0..RANDOM_ID_ATTEMPTS)
            .map(|_| rng.gen_range(CONFERENCE_ID_MIN..=CONFERENCE_ID_MAX))
            .collect::<Vec<_>>()
            .into_iter()
            .chain(CONFERENCE_ID_MIN..=CONFERENCE_ID_MAX);

        for id in candidates {
            if let Entry::Vacant(slot) = self.sessions.entry(id) {
                let name = name.clone().unwrap_or_else(|| format!("Conference {}", id));
                let session = ConferenceSession::new(
                    id,
                    manager_id,
                    name,
                    &self.config.session,
                    &self.config.media,
                );
                slot.insert(Arc::clone(&session));
                return Ok(session);
            }
        }
        Err(RegistryError::IdsExhausted.into())
    }

    /// Ports of a running conference
    pub fn join(&self, conference_id: u32) -> std::result::Result<SessionHandle, RegistryError> {
        match self.get(conference_id) {
            Some(session) if session.is_running() => Ok(SessionHandle::of(&session)),
            Some(_) => {
                self.sessions.remove(&conference_id);
                Err(RegistryError::ConferenceNotFound(conference_id))
            }
            None => Err(RegistryError::ConferenceNotFound(conference_id)),
        }
    }

    pub fn get(&self, conference_id: u32) -> Option<Arc<ConferenceSession>> {
        self.sessions.get(&conference_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Stop and forget a session; false if unknown
    pub fn destroy_session(&self, conference_id: u32) -> bool {
        match self.sessions.remove(&conference_id) {
            Some((_, session)) => {
                session.stop(StopReason::Destroyed);
                true
            }
            None => false,
        }
    }

    /// Manager-only cancel
    pub fn cancel(&self, conference_id: u32, requester: &str) -> Result<()> {
        let session = self
            .get(conference_id)
            .ok_or(RegistryError::ConferenceNotFound(conference_id))?;
        session.cancel_conference(requester)?;
        self.sessions.remove(&conference_id);
        Ok(())
    }

    /// Forget sessions that stopped on their own; returns how many
    pub fn prune(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.is_running());
        before - self.sessions.len()
    }

    /// Running conferences, ordered by id
    pub fn conferences(&self) -> Vec<ConferenceInfo> {
        self.prune();
        let mut infos: Vec<ConferenceInfo> = self.sessions.iter().map(|entry| entry.value().info()).collect();
        infos.sort_by_key(|info| info.conference_id);
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop every session
    pub fn shutdown(&self) {
        let ids: Vec<u32> = self.sessions.iter().map(|entry| *entry.key()).collect();
        for id in &ids {
            self.destroy_session(*id);
        }
        info!(stopped = ids.len(), "Registry shut down");
    }

    /// Answer one registry request
    pub async fn handle_request(&self, request: RegistryRequest) -> RegistryResponse {
        match request {
            RegistryRequest::CreateConference { client_id, conference_name } => {
                match self.create_session(&client_id, conference_name).await {
                    Ok(handle) => handle.into_response(),
                    Err(e) => {
                        warn!(client = %client_id, error = %e, "Conference creation failed");
                        RegistryResponse::failed(e.to_string())
                    }
                }
            }
            RegistryRequest::JoinConference { conference_id } => match self.join(conference_id) {
                Ok(handle) => handle.into_response(),
                Err(e) => RegistryResponse::failed(e.to_string()),
            },
            RegistryRequest::GetConferences => {
                let detail = self.conferences();
                RegistryResponse {
                    conferences: Some(detail.iter().map(|info| info.conference_id).collect()),
                    conferences_detail: Some(detail),
                    ..RegistryResponse::success()
                }
            }
            RegistryRequest::CancelConference { conference_id, client_id } => {
                let requester = client_id.unwrap_or_default();
                match self.cancel(conference_id, &requester) {
                    Ok(()) => RegistryResponse {
                        conference_id: Some(conference_id),
                        ..RegistryResponse::success()
                    },
                    Err(e) => RegistryResponse::failed(e.to_string()),
                }
            }
            RegistryRequest::Login {} | RegistryRequest::Register {} | RegistryRequest::Logout {} => {
                let e = Error::from(RegistryError::Unsupported("authentication is handled externally".into()));
                RegistryResponse::failed(e.to_string())
            }
        }
    }
}
