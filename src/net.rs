//! Local address discovery and port selection for the transfer server.

use peershare_core::constants::{AUTO_PORT_ATTEMPTS, AUTO_PORT_START};
use peershare_core::log_debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};

/// Address other peers should use to reach this host.
///
/// Asks the routing table which interface would reach a public address (no
/// packet is sent) and falls back to loopback when there is no route.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        socket.connect(SocketAddr::from(([192, 0, 2, 1], 9)))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() && !ip.is_loopback() => ip,
        Ok(ip) => {
            log_debug!("Route probe returned {}, using loopback", ip);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(e) => {
            log_debug!("No route for address discovery ({}), using loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// Whether a TCP listener can bind `port` on all interfaces right now.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).is_ok()
}

/// First free port in `start..start + attempts`.
pub fn find_available_port(start: u16, attempts: u16) -> Option<u16> {
    (0..attempts)
        .filter_map(|offset| start.checked_add(offset))
        .find(|port| is_port_available(*port))
}

/// Resolve the configured port: 0 selects automatically, anything else must be free.
pub fn resolve_port(configured: u16) -> Option<u16> {
    if configured == 0 {
        find_available_port(AUTO_PORT_START, AUTO_PORT_ATTEMPTS)
    } else if is_port_available(configured) {
        Some(configured)
    } else {
        None
    }
}
