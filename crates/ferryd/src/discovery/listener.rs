//! Service announcement listener.
//!
//! Joins the announcement multicast group and turns ServiceAnnouncement
//! datagrams from nearby peers into registry updates: ANNOUNCE adds or
//! refreshes a peer, GOODBYE removes it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use ferry_core::wire::{announce, ServiceAnnouncement, ANNOUNCE_PORT, MULTICAST_GROUP};
use ferry_core::WireError;
use ferry_services::{DiscoveredPeer, DiscoverySource, PeerRegistry};

/// What one datagram did to the registry.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Seen { id: String, is_new: bool },
    Left { id: String },
    /// Our own announcement, looped back.
    Own,
}

/// Apply one datagram received from `from`.
pub fn handle_datagram(
    registry: &PeerRegistry,
    own_id: &str,
    data: &[u8],
    from: SocketAddr,
) -> Result<Event, WireError> {
    let ann = ServiceAnnouncement::parse(data)?;
    let id = ann.device_id_hex();
    if id == own_id {
        return Ok(Event::Own);
    }

    if ann.kind == announce::GOODBYE {
        registry.remove(&id);
        return Ok(Event::Left { id });
    }

    let mut peer = DiscoveredPeer::new(
        id.clone(),
        ann.display_name(),
        SocketAddr::new(from.ip(), ann.port.get()),
        DiscoverySource::Broadcast,
    );
    peer.version = Some(ann.version.get());
    let is_new = registry.upsert(peer);
    Ok(Event::Seen { id, is_new })
}

/// Listen for announcements until `shutdown` fires.
pub async fn listen_loop(
    socket: UdpSocket,
    registry: Arc<PeerRegistry>,
    own_id: String,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut buf = vec![0u8; 1024];

    tracing::info!(port = ANNOUNCE_PORT, group = %MULTICAST_GROUP, "announcement listener starting");

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.recv() => return Ok(()),
            r = socket.recv_from(&mut buf) => match r {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
        };

        match handle_datagram(&registry, &own_id, &buf[..len], from) {
            Ok(event) => tracing::trace!(?event, %from, "announcement"),
            Err(e) => tracing::trace!(error = %e, %from, "ignoring datagram"),
        }
    }
}

/// Create a UDP socket joined to the announcement group.
pub fn make_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, ANNOUNCE_PORT);
    socket.bind(&bind_addr.into()).context("bind()")?;
    socket
        .join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)
        .context("IP_ADD_MEMBERSHIP")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}
