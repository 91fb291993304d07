//! Peer discovery fills the shared [`PeerRegistry`].
//!
//! Two sources feed the registry: multicast announcements (`advertise` +
//! `listener`) and active /24 probing (`scan`). The refresh loop here
//! evicts peers that went quiet, whichever source found them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_services::PeerRegistry;
use tokio::sync::broadcast;

pub mod advertise;
pub mod listener;
pub mod scan;

/// What this endpoint tells the network about itself.
#[derive(Debug, Clone)]
pub struct Identity {
    pub device_id: [u8; 16],
    pub name: String,
    /// TCP port of the transfer listener.
    pub port: u16,
}

impl Identity {
    pub fn id_hex(&self) -> String {
        hex::encode(self.device_id)
    }
}

/// Evict peers not seen within `timeout`, every `interval`.
pub async fn refresh_loop(
    registry: Arc<PeerRegistry>,
    interval: Duration,
    timeout: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(interval);
    tracing::info!(
        interval_secs = interval.as_secs(),
        timeout_secs = timeout.as_secs(),
        "peer refresh starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                let evicted = registry.evict_stale(timeout, Instant::now());
                if !evicted.is_empty() {
                    tracing::debug!(removed = evicted.len(), "expired peer registry entries");
                }
            }
        }
    }
}
