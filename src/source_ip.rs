//! Source-IP selection
//!
//! When dialing, the reuse pool prefers a transport already bound to the
//! local IP the host would route packets to the remote from. The default
//! selector asks the OS: connecting an unbound UDP socket performs a
//! routing-table lookup without sending anything, and the socket's local
//! address reveals the chosen source IP.
//!
//! Selection is purely advisory. Any failure downgrades the dial to "any
//! unicast transport".

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};

use crate::addr::Family;

/// Picks the preferred local source IP for a remote address.
pub trait SourceIpSelector: Send + Sync {
    fn preferred_source_ip(&self, remote: SocketAddr) -> io::Result<IpAddr>;
}

/// Default selector backed by the host routing table.
#[derive(Debug, Default)]
pub struct RouteSelector;

impl SourceIpSelector for RouteSelector {
    fn preferred_source_ip(&self, remote: SocketAddr) -> io::Result<IpAddr> {
        let socket = UdpSocket::bind(Family::of_addr(&remote).wildcard())?;
        socket.connect(remote)?;
        Ok(socket.local_addr()?.ip())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_remote_selects_loopback_source() {
        let ip = RouteSelector
            .preferred_source_ip("127.0.0.1:4001".parse().unwrap())
            .unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn selected_ip_matches_remote_family() {
        let ip = RouteSelector
            .preferred_source_ip("[::1]:4001".parse().unwrap())
            .unwrap();
        assert!(matches!(ip, IpAddr::V6(_)));
    }
}
