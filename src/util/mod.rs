use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use str0m::net::Protocol;
use str0m::Candidate;
use systemstat::{Platform, System};
use tracing::debug;

use crate::error::SessionError;

/// First routable IPv4 address of this host.
///
/// `None` when the interfaces cannot be listed or none is routable.
pub fn select_host_address() -> Option<IpAddr> {
    let networks = System::new().networks().ok()?;

    networks
        .values()
        .flat_map(|net| net.addrs.iter())
        .find_map(|n| match n.addr {
            systemstat::IpAddr::V4(v) if routable(v) && !v.is_broadcast() => Some(IpAddr::V4(v)),
            _ => None,
        })
}

/// Turns a configured bind address into one a peer can send to.
///
/// ICE matches every received datagram against the local candidate it was
/// addressed to, so the socket must be bound to the same concrete address
/// that is offered. A wildcard IP is replaced by the host address; the port
/// is kept.
pub fn resolve_bind(bind: SocketAddr) -> Result<SocketAddr, SessionError> {
    if !bind.ip().is_unspecified() {
        return Ok(bind);
    }

    let ip = select_host_address()
        .or_else(|| local_ip_address::local_ip().ok())
        .ok_or(SessionError::NoCandidates)?;

    debug!(%ip, "resolved wildcard bind to host address");
    Ok(SocketAddr::new(ip, bind.port()))
}

/// The host candidate of a socket bound to a concrete address.
pub fn get_candidates(socket: &UdpSocket) -> Result<Vec<Candidate>, SessionError> {
    let local = socket.local_addr()?;
    if local.ip().is_unspecified() {
        return Err(SessionError::NoCandidates);
    }

    let candidate =
        Candidate::host(local, Protocol::Udp).map_err(|e| SessionError::Candidate(e.to_string()))?;
    Ok(vec![candidate])
}

fn routable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}
