//! Pre-bind check that the local port is free.
//!
//! The check connects to the port: if something accepts, the port is taken.
//! It is best effort; another process can still grab the port between the
//! probe and the bind, which [`TunnelSession::bind`](crate::TunnelSession::bind)
//! reports the same way.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;

/// Upper bound on how long the probe connect may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Returns `true` if something is already accepting connections on `addr`.
///
/// An unspecified address (`0.0.0.0` / `::`) is probed on the loopback
/// address of the same family. The probe socket is dropped before this
/// function returns on every path.
pub async fn is_port_in_use(addr: SocketAddr) -> bool {
    let target = probe_target(addr);
    let in_use = matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await,
        Ok(Ok(_))
    );
    if in_use {
        tracing::info!(port = addr.port(), "Port is NOT open");
    } else {
        tracing::info!(port = addr.port(), "Port is open");
    }
    in_use
}

fn probe_target(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, addr.port())
}
