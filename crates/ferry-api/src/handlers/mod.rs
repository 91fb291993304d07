//! HTTP API handlers: exposes daemon state as JSON.

pub mod peers;
pub mod sessions;
pub mod status;
pub mod transfer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;

use ferry_services::{PeerRegistry, SessionError, SessionManager, TaskScheduler};

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
    pub scheduler: Arc<TaskScheduler>,
    pub registry: Arc<PeerRegistry>,
    pub device_id: String,
    pub device_name: String,
    /// TCP port of the transfer listener.
    pub listen_port: u16,
    /// Chunk size for new outbound sessions. `None` = adaptive.
    pub chunk_size: Option<u32>,
    /// Default age for `/sessions/cleanup`.
    pub retention: Duration,
    pub started_at: Instant,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

fn session_error(e: SessionError) -> (StatusCode, String) {
    let status = match &e {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SessionError::NoFiles | SessionError::Plan(_) => StatusCode::BAD_REQUEST,
        SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use peers::handle_peers;
pub use sessions::{
    handle_cancel, handle_cleanup, handle_pause, handle_resume, handle_retry,
    handle_session_inspect, handle_sessions,
};
pub use status::{handle_chunks, handle_status};
pub use transfer::handle_send;
