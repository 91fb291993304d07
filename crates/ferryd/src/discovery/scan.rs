//! Active subnet scan.
//!
//! Fallback for networks that drop multicast. Every host of each local
//! IPv4 /24 gets a HELLO probe on the transfer port; anything answering
//! with a PEER token is recorded in the registry.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::stream::{self, StreamExt};
use nix::net::if_::InterfaceFlags;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::MissedTickBehavior;

use ferry_core::wire::Control;
use ferry_services::transfer::frame::{read_token, write_token};
use ferry_services::{DiscoveredPeer, DiscoverySource, PeerRegistry, TransferError};

/// Scan parameters, taken from the network config.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub port: u16,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent: usize,
}

/// Up, non-loopback IPv4 addresses of this host.
pub fn local_ipv4s() -> Vec<Ipv4Addr> {
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return Vec::new();
    };
    let mut out: Vec<Ipv4Addr> = addrs
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifa| ifa.address.and_then(|a| a.as_sockaddr_in().map(|s| s.ip())))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Every host address of `own`'s /24 except `own` itself.
pub fn scan_targets(own: Ipv4Addr, port: u16) -> Vec<SocketAddr> {
    let [a, b, c, _] = own.octets();
    (1..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != own)
        .map(|ip| SocketAddr::new(IpAddr::V4(ip), port))
        .collect()
}

/// Send HELLO to `addr` and wait for its identity.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> Result<(String, String), TransferError> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::Connect {
            addr,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|e| TransferError::Connect { addr, source: e })?;

    write_token(&mut stream, &Control::Hello, timeout).await?;
    match read_token(&mut stream, timeout).await? {
        Control::Peer { id, name } => Ok((id, name)),
        other => Err(TransferError::Unexpected {
            expected: "PEER",
            got: other.to_string(),
        }),
    }
}

/// Longest a sweep over `targets` hosts can take when nobody answers.
pub fn sweep_duration(targets: usize, settings: &ScanSettings) -> Duration {
    let rounds = targets.div_ceil(settings.max_concurrent.max(1));
    settings.probe_timeout * rounds as u32
}

/// Longest gap between two sightings of a known peer that keeps answering:
/// one recheck tick, a wait for a probe slot, then connect, HELLO and PEER.
pub fn recheck_gap(settings: &ScanSettings) -> Duration {
    settings.interval + settings.probe_timeout * 6
}

async fn probe_with(
    permits: &Semaphore,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(String, String), TransferError> {
    let _permit = permits.acquire().await.map_err(|_| TransferError::Closed)?;
    probe(addr, timeout).await
}

/// Probe `targets`, at most `permits` at a time. Returns how many answered.
pub async fn scan_once(
    registry: &PeerRegistry,
    own_id: &str,
    targets: Vec<SocketAddr>,
    settings: &ScanSettings,
    permits: &Semaphore,
) -> usize {
    let timeout = settings.probe_timeout;
    let mut answers = stream::iter(targets)
        .map(|addr| async move { (addr, probe_with(permits, addr, timeout).await) })
        .buffer_unordered(settings.max_concurrent.max(1));

    let mut found = 0;
    while let Some((addr, result)) = answers.next().await {
        match result {
            Ok((id, _)) if id == own_id => {}
            Ok((id, name)) => {
                found += 1;
                if registry.upsert(DiscoveredPeer::new(id, name, addr, DiscoverySource::Scan)) {
                    tracing::debug!(%addr, "scan found peer");
                }
            }
            Err(e) => tracing::trace!(%addr, error = %e, "probe failed"),
        }
    }
    found
}

/// Re-probe the peers earlier sweeps found. A full sweep can outlast the
/// eviction window; this keeps answering peers fresh in between.
pub async fn recheck_known(
    registry: &PeerRegistry,
    own_id: &str,
    settings: &ScanSettings,
    permits: &Semaphore,
) -> usize {
    let known: Vec<SocketAddr> = registry
        .snapshot()
        .into_iter()
        .filter(|p| p.source == DiscoverySource::Scan)
        .map(|p| p.addr)
        .collect();
    if known.is_empty() {
        return 0;
    }
    scan_once(registry, own_id, known, settings, permits).await
}

async fn sweep_loop(registry: &PeerRegistry, own_id: &str, settings: &ScanSettings, permits: &Semaphore) {
    let mut tick = tokio::time::interval(settings.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let locals = local_ipv4s();
        if locals.is_empty() {
            registry.report_error("no IPv4 network interface to scan");
            continue;
        }
        registry.clear_error();

        let targets: Vec<SocketAddr> = locals
            .iter()
            .flat_map(|ip| scan_targets(*ip, settings.port))
            .collect();
        let started = Instant::now();
        let found = scan_once(registry, own_id, targets, settings, permits).await;
        tracing::debug!(found, elapsed_ms = started.elapsed().as_millis() as u64, "subnet scan finished");
    }
}

async fn recheck_loop(registry: &PeerRegistry, own_id: &str, settings: &ScanSettings, permits: &Semaphore) {
    let mut tick = tokio::time::interval(settings.interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let seen = recheck_known(registry, own_id, settings, permits).await;
        tracing::trace!(seen, "known peers rechecked");
    }
}

/// Sweep every local /24 each interval and recheck known peers on the
/// same cadence, until `shutdown` fires. Both share one probe budget.
pub async fn scan_loop(
    registry: Arc<PeerRegistry>,
    own_id: String,
    settings: ScanSettings,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let permits = Semaphore::new(settings.max_concurrent.max(1));
    tracing::info!(
        port = settings.port,
        interval_secs = settings.interval.as_secs(),
        sweep_secs = sweep_duration(253, &settings).as_secs(),
        "subnet scan starting"
    );

    tokio::select! {
        _ = shutdown.recv() => {}
        () = sweep_loop(&registry, &own_id, &settings, &permits) => {}
        () = recheck_loop(&registry, &own_id, &settings, &permits) => {}
    }
    Ok(())
}
