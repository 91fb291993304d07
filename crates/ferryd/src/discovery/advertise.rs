//! Service announcement broadcast.
//!
//! Periodically multicasts a ServiceAnnouncement to the organisation-local
//! group so nearby peers can find our transfer listener. A GOODBYE goes
//! out on shutdown so peers drop us without waiting for eviction.

use std::net::SocketAddrV4;
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use zerocopy::AsBytes;

use ferry_core::wire::{announce, ServiceAnnouncement, ANNOUNCE_PORT, MULTICAST_GROUP};

use super::Identity;

/// Broadcast our announcement every `interval` until `shutdown` fires.
pub async fn advertise_loop(
    socket: UdpSocket,
    identity: Identity,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let dest = SocketAddrV4::new(MULTICAST_GROUP, ANNOUNCE_PORT);
    let hello = ServiceAnnouncement::new(
        announce::ANNOUNCE,
        identity.device_id,
        &identity.name,
        identity.port,
    );
    let mut tick = tokio::time::interval(interval);

    tracing::info!(
        group = %dest,
        name = %identity.name,
        interval_secs = interval.as_secs(),
        "service announcement starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                match socket.send_to(hello.as_bytes(), dest).await {
                    Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
                    Err(e) => tracing::warn!(error = %e, "announcement send failed"),
                }
            }
        }
    }

    let bye = ServiceAnnouncement::new(
        announce::GOODBYE,
        identity.device_id,
        &identity.name,
        identity.port,
    );
    socket
        .send_to(bye.as_bytes(), dest)
        .await
        .context("failed to send goodbye")?;
    tracing::info!("goodbye sent");
    Ok(())
}

/// Create a UDP socket suitable for sending IPv4 multicast.
pub fn make_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    // TTL 1: never routed off the local subnet
    socket.set_multicast_ttl_v4(1).context("IP_MULTICAST_TTL")?;
    // Other endpoints on this host listen too.
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}
