//! File sending command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{base_url, post_json_body};
use super::human_bytes;

#[derive(Serialize)]
struct SendRequest {
    peer_id: String,
    paths: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct SendResponse {
    session_id: String,
    peer: String,
    files: usize,
    total_bytes: u64,
}

pub async fn cmd_send(port: u16, peer_id: &str, paths: &[&str]) -> Result<()> {
    if paths.is_empty() {
        anyhow::bail!("send needs at least one path");
    }
    // The daemon resolves paths itself, so hand it absolute ones.
    let paths = paths
        .iter()
        .map(|p| std::path::absolute(p).with_context(|| format!("bad path {}", p)))
        .collect::<Result<Vec<_>>>()?;

    let req = SendRequest {
        peer_id: peer_id.to_string(),
        paths,
    };
    let resp: SendResponse = post_json_body(&format!("{}/send", base_url(port)), &req).await?;

    println!(
        "✓ Queued {} file(s), {} to {}",
        resp.files,
        human_bytes(resp.total_bytes),
        resp.peer
    );
    println!("  session: {}", resp.session_id);
    Ok(())
}
