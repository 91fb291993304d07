//! Daemon status, peers and chunk storage commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};
use super::{human_bytes, short};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    device_id: String,
    device_name: String,
    listen_port: u16,
    uptime_secs: u64,
    peers_discovered: usize,
    discovery_error: Option<String>,
    sessions: SessionCounts,
    queue: QueueInfo,
}

#[derive(Deserialize)]
struct SessionCounts {
    active: usize,
    completed: usize,
}

#[derive(Deserialize)]
struct QueueInfo {
    queued: usize,
    running: Vec<String>,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    id: String,
    name: String,
    addr: String,
    version: Option<u32>,
    source: String,
    last_seen_secs: u64,
}

#[derive(Deserialize)]
struct ChunksResponse {
    outbound: StoreStats,
    inbound: StoreStats,
}

#[derive(Deserialize)]
struct StoreStats {
    files: usize,
    chunks_total: u64,
    chunks_completed: u64,
    chunks_failed: u64,
    payload_bytes: u64,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Ferry Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Device           : {} ({})", resp.device_name, short(&resp.device_id));
    println!("  Listening on     : {}", resp.listen_port);
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Peers discovered : {}", resp.peers_discovered);
    println!("  Active sessions  : {}", resp.sessions.active);
    println!("  Finished sessions: {}", resp.sessions.completed);
    println!("  Queued work      : {}", resp.queue.queued);
    println!("  Running          : {}", resp.queue.running.len());
    if let Some(err) = resp.discovery_error {
        println!("\n  ⚠ discovery: {}", err);
    }

    Ok(())
}

pub async fn cmd_peers(port: u16) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(port))).await?;

    if resp.peers.is_empty() {
        println!("No peers discovered yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Discovered Peers ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        println!("  ┌─ {}", p.name);
        println!("  │  id        : {}", p.id);
        println!("  │  addr      : {}", p.addr);
        if let Some(v) = p.version {
            println!("  │  version   : {}", v);
        }
        println!("  │  via       : {}", p.source);
        println!("  └─ last seen : {}s ago", p.last_seen_secs);
    }

    Ok(())
}

pub async fn cmd_chunks(port: u16) -> Result<()> {
    let resp: ChunksResponse = get_json(&format!("{}/chunks", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Chunk Storage");
    println!("═══════════════════════════════════════");
    for (label, s) in [("outbound", &resp.outbound), ("inbound", &resp.inbound)] {
        println!(
            "  {:<9}: {} files, {}/{} chunks done, {} failed, {} on disk",
            label,
            s.files,
            s.chunks_completed,
            s.chunks_total,
            s.chunks_failed,
            human_bytes(s.payload_bytes)
        );
    }

    Ok(())
}
