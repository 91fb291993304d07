//! /status and /chunks handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use ferry_services::StoreStats;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub device_id: String,
    pub device_name: String,
    pub listen_port: u16,
    pub uptime_secs: u64,
    pub peers_discovered: usize,
    /// Last discovery failure, if discovery is degraded.
    pub discovery_error: Option<String>,
    pub sessions: SessionCounts,
    pub queue: QueueInfo,
}

#[derive(Serialize)]
pub struct SessionCounts {
    pub active: usize,
    pub completed: usize,
}

#[derive(Serialize)]
pub struct QueueInfo {
    pub queued: usize,
    pub running: Vec<String>,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        device_id: state.device_id.clone(),
        device_name: state.device_name.clone(),
        listen_port: state.listen_port,
        uptime_secs: state.started_at.elapsed().as_secs(),
        peers_discovered: state.registry.len(),
        discovery_error: state.registry.last_error(),
        sessions: SessionCounts {
            active: state.sessions.list_active().len(),
            completed: state.sessions.list_completed().len(),
        },
        queue: QueueInfo {
            queued: state.scheduler.queued().len(),
            running: state.scheduler.running(),
        },
    })
}

// ── /chunks ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ChunksResponse {
    pub outbound: StoreStats,
    pub inbound: StoreStats,
}

pub async fn handle_chunks(State(state): State<ApiState>) -> Json<ChunksResponse> {
    Json(ChunksResponse {
        outbound: state.sessions.outbound_store().stats(),
        inbound: state.sessions.inbound_store().stats(),
    })
}
