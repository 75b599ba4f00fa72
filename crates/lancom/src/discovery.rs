//! Master discovery via UDP broadcast.
//!
//! The master repeatedly broadcasts a [`Beacon`] to the /24 broadcast
//! address of its own IP. A peer starting up listens once on the discovery
//! port and takes the first well-formed beacon it hears.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::config::{BEACON_TAG, PROTOCOL_VERSION};
use crate::error::{LanComError, Result};
use crate::identity::NodeId;

/// The announcement a master broadcasts:
/// `LancomMaster|<version>|<masterID>|<masterIP>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub version: String,
    pub master_id: NodeId,
    pub master_ip: Ipv4Addr,
}

impl Beacon {
    pub fn new(master_id: NodeId, master_ip: Ipv4Addr) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            master_id,
            master_ip,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{BEACON_TAG}|{}|{}|{}",
            self.version, self.master_id, self.master_ip
        )
    }

    /// Parse a datagram. Anything without our tag or with the wrong shape
    /// yields `None`.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(datagram).ok()?;
        let mut parts = text.trim_end().split('|');
        if parts.next()? != BEACON_TAG {
            return None;
        }
        let version = parts.next()?.to_string();
        let master_id = parts.next().filter(|id| !id.is_empty())?;
        let master_ip = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            version,
            master_id: NodeId::from_string(master_id),
            master_ip,
        })
    }

    /// Address of a master endpoint listening on `port`.
    pub fn master_addr(&self, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.master_ip, port))
    }
}

/// The /24 broadcast address of `ip`.
pub fn broadcast_addr(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

/// The IPv4 address of the interface that routes off-host. Nothing is
/// sent; connecting a UDP socket only selects the route.
pub fn detect_local_ip() -> Result<Ipv4Addr> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    let probe = SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80));
    socket.connect(&probe.into())?;
    socket
        .local_addr()?
        .as_socket_ipv4()
        .map(|addr| *addr.ip())
        .ok_or_else(|| LanComError::Protocol("local address is not IPv4".to_string()))
}

/// Broadcast `beacon` on `port` every `interval` until `shutdown` flips.
/// Failed sends are logged and retried on the next tick.
pub async fn run_beacon(
    beacon: Beacon,
    port: u16,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    let target = SocketAddr::V4(SocketAddrV4::new(broadcast_addr(beacon.master_ip), port));
    let datagram = beacon.encode().into_bytes();
    info!("Broadcasting master beacon to {target} every {interval:?}");

    while !*shutdown.borrow() {
        match socket.send_to(&datagram, target).await {
            Ok(_) => trace!("Beacon sent"),
            Err(e) => debug!("Beacon send failed: {e}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Beacon broadcaster stopped");
    Ok(())
}

/// A UDP socket on `0.0.0.0:port` that other processes may bind as well.
fn bind_reusable(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Listen on `port` for up to `timeout` and return the first master beacon.
pub async fn search_for_master(port: u16, timeout: Duration) -> Result<Beacon> {
    let socket = bind_reusable(port)?;
    debug!("Listening for a master beacon on port {port}");

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 1024];
    loop {
        let (len, from) = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
            .await
            .map_err(|_| LanComError::MasterNotFound(timeout))??;
        match Beacon::parse(&buf[..len]) {
            Some(beacon) => {
                info!(
                    "Found master {} at {} (version {})",
                    beacon.master_id, beacon.master_ip, beacon.version
                );
                return Ok(beacon);
            }
            None => trace!("Ignoring non-beacon datagram from {from}"),
        }
    }
}
