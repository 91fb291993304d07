//! /peers handler.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use ferry_services::DiscoverySource;

use super::ApiState;

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub addr: String,
    pub version: Option<u32>,
    pub source: DiscoverySource,
    pub last_seen_secs: u64,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let peers = state
        .registry
        .snapshot()
        .into_iter()
        .map(|p| PeerInfo {
            addr: p.addr.to_string(),
            last_seen_secs: p.last_seen.elapsed().as_secs(),
            id: p.id,
            name: p.name,
            version: p.version,
            source: p.source,
        })
        .collect();

    Json(PeersResponse { peers })
}
