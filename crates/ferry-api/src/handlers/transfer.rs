//! /send handler: starts an outbound session to a discovered peer.

use std::path::PathBuf;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use ferry_core::FileDescriptor;

use super::{session_error, ApiState};

#[derive(Deserialize)]
pub struct SendRequest {
    pub peer_id: String,
    pub paths: Vec<PathBuf>,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub session_id: String,
    pub peer: String,
    pub files: usize,
    pub total_bytes: u64,
}

pub async fn handle_send(
    State(state): State<ApiState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, (StatusCode, String)> {
    if req.paths.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no paths given".to_string()));
    }
    let peer = state
        .registry
        .get(&req.peer_id)
        .ok_or((StatusCode::NOT_FOUND, format!("peer {} not discovered", req.peer_id)))?;

    // Whole-file checksums read every byte; keep that off the runtime.
    let paths = req.paths;
    let files = tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .map(|p| {
                FileDescriptor::from_path(p)
                    .and_then(FileDescriptor::with_checksum)
                    .map_err(|e| (StatusCode::BAD_REQUEST, format!("{}: {}", p.display(), e)))
            })
            .collect::<Result<Vec<_>, _>>()
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;

    let session = state
        .sessions
        .create_outbound(peer.peer_ref(), files, state.chunk_size)
        .map_err(session_error)?;
    state.scheduler.enqueue(&session.id);

    tracing::info!(
        session_id = %session.id,
        peer = %peer.name,
        files = session.files.len(),
        bytes = session.total_bytes,
        "send queued via API"
    );

    Ok(Json(SendResponse {
        session_id: session.id,
        peer: peer.name,
        files: session.files.len(),
        total_bytes: session.total_bytes,
    }))
}
