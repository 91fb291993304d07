//! Peer registry: the live set of discovered peers.
//!
//! Fed by the broadcast listener and the active scanner, drained by the
//! refresh loop. Every change to the set is published on a watch channel,
//! and discovery failures on a second one.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ferry_core::model::PeerRef;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    Broadcast,
    Scan,
}

/// Tracked state for one discovered peer.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPeer {
    pub id: String,
    pub name: String,
    /// Address of the peer's transfer listener.
    pub addr: SocketAddr,
    /// Protocol version, when the peer announced one.
    pub version: Option<u32>,
    pub source: DiscoverySource,
    /// Last time any announcement or probe answer arrived.
    #[serde(skip)]
    pub last_seen: Instant,
}

impl DiscoveredPeer {
    pub fn new(id: String, name: String, addr: SocketAddr, source: DiscoverySource) -> Self {
        Self {
            id,
            name,
            addr,
            version: None,
            source,
            last_seen: Instant::now(),
        }
    }

    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: self.id.clone(),
            name: self.name.clone(),
            addr: self.addr,
        }
    }

    fn same_identity(&self, other: &DiscoveredPeer) -> bool {
        self.name == other.name && self.addr == other.addr && self.version == other.version
    }
}

pub struct PeerRegistry {
    peers: DashMap<String, DiscoveredPeer>,
    tx: watch::Sender<Vec<DiscoveredPeer>>,
    errors: watch::Sender<Option<String>>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a new empty registry, shared between discovery tasks and the API.
pub fn new_registry() -> Arc<PeerRegistry> {
    Arc::new(PeerRegistry::new())
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            tx: watch::channel(Vec::new()).0,
            errors: watch::channel(None).0,
        }
    }

    /// Add or refresh a peer. Returns true if it was not known before.
    pub fn upsert(&self, peer: DiscoveredPeer) -> bool {
        let (is_new, changed) = match self.peers.get_mut(&peer.id) {
            Some(mut existing) => {
                let changed = !existing.same_identity(&peer);
                *existing = peer.clone();
                (false, changed)
            }
            None => {
                self.peers.insert(peer.id.clone(), peer.clone());
                (true, true)
            }
        };

        if is_new {
            tracing::info!(peer = %peer.id, name = %peer.name, addr = %peer.addr, source = ?peer.source, "peer discovered");
        }
        if changed {
            self.publish();
        }
        is_new
    }

    /// Drop a peer immediately (goodbye). Returns true if it was known.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.peers.remove(id).is_some();
        if removed {
            tracing::info!(peer = id, "peer left");
            self.publish();
        }
        removed
    }

    /// Evict every peer not seen within `timeout` of `now`.
    pub fn evict_stale(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut evicted = Vec::new();
        self.peers.retain(|id, peer| {
            let fresh = now.saturating_duration_since(peer.last_seen) < timeout;
            if !fresh {
                evicted.push(id.clone());
            }
            fresh
        });
        if !evicted.is_empty() {
            for id in &evicted {
                tracing::info!(peer = %id, "peer evicted");
            }
            self.publish();
        }
        evicted
    }

    pub fn get(&self, id: &str) -> Option<DiscoveredPeer> {
        self.peers.get(id).map(|p| p.clone())
    }

    /// First peer whose listener lives at `ip`.
    pub fn find_by_ip(&self, ip: IpAddr) -> Option<DiscoveredPeer> {
        self.peers
            .iter()
            .find(|p| p.addr.ip() == ip)
            .map(|p| p.clone())
    }

    /// All peers, sorted by name.
    pub fn snapshot(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self.peers.iter().map(|p| p.clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredPeer>> {
        self.tx.subscribe()
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.errors.subscribe()
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(error = %message, "discovery error");
        self.errors.send_replace(Some(message));
    }

    pub fn clear_error(&self) {
        self.errors.send_if_modified(|current| current.take().is_some());
    }

    pub fn last_error(&self) -> Option<String> {
        self.errors.borrow().clone()
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}
