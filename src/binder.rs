//! UDP socket binding
//!
//! The binder is the single place sockets are opened, abstracted behind a
//! trait so tests can substitute their own. No retries, no fallbacks: the
//! OS error surfaces to the caller.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use crate::addr::Family;

/// Opens UDP sockets for the reuse pools and the connection manager.
pub trait SocketBinder: Send + Sync {
    /// Bind a nonblocking UDP socket to `addr`. `addr` must belong to
    /// `family`.
    fn bind(&self, family: Family, addr: SocketAddr) -> io::Result<UdpSocket>;
}

/// Default binder: a plain OS bind.
#[derive(Debug, Default)]
pub struct SystemBinder;

impl SocketBinder for SystemBinder {
    fn bind(&self, family: Family, addr: SocketAddr) -> io::Result<UdpSocket> {
        if !family.contains(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address {addr} does not belong to family {family}"),
            ));
        }
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let socket = SystemBinder
            .bind(Family::Udp4, "127.0.0.1:0".parse().unwrap())
            .unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn rejects_family_mismatch() {
        let err = SystemBinder
            .bind(Family::Udp6, "127.0.0.1:0".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
