//! Session listing, inspection and lifecycle commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};
use super::{human_bytes, short};

#[derive(Deserialize)]
struct SessionsResponse {
    sessions: Vec<SessionInfo>,
}

#[derive(Deserialize)]
struct SessionInfo {
    id: String,
    direction: String,
    status: String,
    files: Vec<FileInfo>,
    total_bytes: u64,
    transferred_bytes: u64,
    peer: PeerRef,
    error: Option<String>,
    warnings: Vec<String>,
    progress_percent: f64,
    running: bool,
}

#[derive(Deserialize)]
struct FileInfo {
    name: String,
    size: u64,
    content: String,
}

#[derive(Deserialize)]
struct PeerRef {
    name: String,
    addr: String,
}

#[derive(Deserialize)]
struct CleanupResponse {
    removed: usize,
}

pub async fn cmd_sessions(port: u16) -> Result<()> {
    let resp: SessionsResponse = get_json(&format!("{}/sessions", base_url(port))).await?;

    if resp.sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }

    println!(
        "  {:<8}  {:<8}  {:<11}  {:>6}  {:>10}  PEER",
        "ID", "DIR", "STATUS", "DONE", "SIZE"
    );
    for s in &resp.sessions {
        println!(
            "  {:<8}  {:<8}  {:<11}  {:>5.1}%  {:>10}  {}",
            short(&s.id),
            s.direction,
            s.status,
            s.progress_percent,
            human_bytes(s.total_bytes),
            s.peer.name
        );
    }

    Ok(())
}

pub async fn cmd_session_inspect(port: u16, session_id: &str) -> Result<()> {
    let s: SessionInfo = get_json(&format!("{}/sessions/{}", base_url(port), session_id)).await?;
    print_session(&s);
    Ok(())
}

fn print_session(s: &SessionInfo) {
    println!("═══════════════════════════════════════");
    println!("  Session {}", s.id);
    println!("═══════════════════════════════════════");
    println!("  Direction : {}", s.direction);
    println!("  Status    : {}{}", s.status, if s.running { " (running)" } else { "" });
    println!("  Peer      : {} ({})", s.peer.name, s.peer.addr);
    println!(
        "  Progress  : {:.1}% ({} of {})",
        s.progress_percent,
        human_bytes(s.transferred_bytes),
        human_bytes(s.total_bytes)
    );
    if let Some(err) = &s.error {
        println!("  Error     : {}", err);
    }
    for w in &s.warnings {
        println!("  ⚠ {}", w);
    }
    println!("\n  Files:");
    for f in &s.files {
        println!("  • {} ({}) → {}", f.name, human_bytes(f.size), f.content);
    }
}

/// `pause`, `resume`, `cancel` or `retry`.
pub async fn cmd_session_action(port: u16, action: &str, session_id: &str) -> Result<()> {
    let s: SessionInfo = post_json(&format!(
        "{}/sessions/{}/{}",
        base_url(port),
        session_id,
        action
    ))
    .await?;
    println!("✓ {} → {}", short(&s.id), s.status);
    Ok(())
}

pub async fn cmd_cleanup(port: u16, max_age_secs: Option<u64>) -> Result<()> {
    let url = match max_age_secs {
        Some(secs) => format!("{}/sessions/cleanup?max_age_secs={}", base_url(port), secs),
        None => format!("{}/sessions/cleanup", base_url(port)),
    };
    let resp: CleanupResponse = post_json(&url).await?;
    println!("Removed {} finished sessions.", resp.removed);
    Ok(())
}
