//! /sessions handlers: listing, inspection and lifecycle control.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use ferry_core::{Direction, TransferSession};

use super::{session_error, ApiState};

#[derive(Serialize)]
pub struct SessionInfo {
    #[serde(flatten)]
    pub session: TransferSession,
    pub progress_percent: f64,
    /// Whether the scheduler currently runs this session.
    pub running: bool,
}

impl SessionInfo {
    fn new(state: &ApiState, session: TransferSession) -> Self {
        Self {
            progress_percent: session.progress_percent(),
            running: state.scheduler.is_running(&session.id),
            session,
        }
    }
}

// ── /sessions (GET) ───────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    let sessions = state
        .sessions
        .list()
        .into_iter()
        .map(|s| SessionInfo::new(&state, s))
        .collect();
    Json(SessionsResponse { sessions })
}

// ── /sessions/{id} (GET) ──────────────────────────────────────────────────────

pub async fn handle_session_inspect(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or((StatusCode::NOT_FOUND, "session not found".to_string()))?;
    Ok(Json(SessionInfo::new(&state, session)))
}

// ── /sessions/{id}/pause|resume|cancel|retry ──────────────────────────────────

pub async fn handle_pause(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = state.sessions.pause(&session_id).map_err(session_error)?;
    state.scheduler.cancel(&session_id);
    tracing::info!(session_id = %session_id, "session paused via API");
    Ok(Json(SessionInfo::new(&state, session)))
}

pub async fn handle_resume(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = state.sessions.resume(&session_id).map_err(session_error)?;
    // Inbound sessions wait for the sender to reconnect.
    if session.direction == Direction::Outbound {
        state.scheduler.enqueue(&session_id);
    }
    tracing::info!(session_id = %session_id, "session resumed via API");
    Ok(Json(SessionInfo::new(&state, session)))
}

pub async fn handle_cancel(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    state.scheduler.cancel(&session_id);
    let session = state.sessions.cancel(&session_id).map_err(session_error)?;
    tracing::info!(session_id = %session_id, "session cancelled via API");
    Ok(Json(SessionInfo::new(&state, session)))
}

pub async fn handle_retry(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionInfo>, (StatusCode, String)> {
    let session = state.sessions.retry(&session_id).map_err(session_error)?;
    if session.direction == Direction::Outbound {
        state.scheduler.enqueue(&session_id);
    }
    tracing::info!(session_id = %session_id, "session retried via API");
    Ok(Json(SessionInfo::new(&state, session)))
}

// ── /sessions/cleanup (POST) ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CleanupParams {
    /// Overrides the configured retention.
    pub max_age_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

pub async fn handle_cleanup(
    State(state): State<ApiState>,
    Query(params): Query<CleanupParams>,
) -> Json<CleanupResponse> {
    let max_age = params
        .max_age_secs
        .map(Duration::from_secs)
        .unwrap_or(state.retention);
    let removed = state.sessions.cleanup(max_age);
    tracing::info!(removed, "sessions cleaned up via API");
    Json(CleanupResponse { removed })
}
