//! HTTP API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, RegistryError, SessionError};
use crate::protocol::ConferenceInfo;
use crate::registry::Registry;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Relay status
#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub conference_count: usize,
    pub uptime_seconds: u64,
}

/// Get relay status
pub async fn get_status(State(registry): State<Arc<Registry>>) -> Json<ApiResponse<SystemStatus>> {
    registry.prune();
    let uptime = (Utc::now() - registry.started_at()).num_seconds().max(0) as u64;

    Json(ApiResponse::ok(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        conference_count: registry.len(),
        uptime_seconds: uptime,
    }))
}

/// List running conferences
pub async fn get_conferences(State(registry): State<Arc<Registry>>) -> Json<ApiResponse<Vec<ConferenceInfo>>> {
    Json(ApiResponse::ok(registry.conferences()))
}

/// Get one conference
pub async fn get_conference(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<u32>,
) -> (StatusCode, Json<ApiResponse<ConferenceInfo>>) {
    match registry.get(id).filter(|session| session.is_running()) {
        Some(session) => (StatusCode::OK, Json(ApiResponse::ok(session.info()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(RegistryError::ConferenceNotFound(id).to_string())),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    pub client_id: String,
}

/// Cancel a conference on behalf of its manager
pub async fn cancel_conference(
    State(registry): State<Arc<Registry>>,
    Path(id): Path<u32>,
    Query(query): Query<CancelQuery>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match registry.cancel(id, &query.client_id) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(e) => {
            let status = match &e {
                Error::Registry(RegistryError::ConferenceNotFound(_)) => StatusCode::NOT_FOUND,
                Error::Session(SessionError::NotManager { .. }) => StatusCode::FORBIDDEN,
                Error::Session(SessionError::NotRunning(_)) => StatusCode::CONFLICT,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ApiResponse::error(e.to_string())))
        }
    }
}
