//! QUIC address types
//!
//! Listen and dial addresses arrive as multiaddresses of the form
//! `/ip4/<ip>/udp/<port>/quic-v1` (or `/ip6/...`). Parsing validates the
//! structure and keeps the QUIC version segment as an opaque tag; the tag
//! is only resolved to a concrete [`QuicVersion`] when a listen or dial
//! actually needs one, so unsupported versions fail before any socket is
//! bound.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use crate::error::{Error, Result};

/// UDP address family. Each family has its own reuse pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Udp4,
    Udp6,
}

impl Family {
    /// The family a socket address belongs to.
    pub fn of_addr(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::Udp4,
            SocketAddr::V6(_) => Family::Udp6,
        }
    }

    /// Parse a network name (`"udp4"` / `"udp6"`).
    pub fn from_name(name: &str) -> Result<Family> {
        match name {
            "udp4" => Ok(Family::Udp4),
            "udp6" => Ok(Family::Udp6),
            other => Err(Error::InvalidFamily(other.to_string())),
        }
    }

    /// Network name, `"udp4"` or `"udp6"`.
    pub fn name(&self) -> &'static str {
        match self {
            Family::Udp4 => "udp4",
            Family::Udp6 => "udp6",
        }
    }

    /// The wildcard bind address with an ephemeral port (`0.0.0.0:0` / `[::]:0`).
    pub fn wildcard(&self) -> SocketAddr {
        match self {
            Family::Udp4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            Family::Udp6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }

    /// Whether `addr` belongs to this family.
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        Family::of_addr(addr) == *self
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Supported QUIC protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuicVersion {
    V1,
}

impl QuicVersion {
    /// The multiaddress segment for this version.
    pub fn tag(&self) -> &'static str {
        match self {
            QuicVersion::V1 => "quic-v1",
        }
    }
}

impl fmt::Display for QuicVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A parsed QUIC multiaddress: socket address plus QUIC version tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicAddr {
    socket: SocketAddr,
    version_tag: String,
}

impl QuicAddr {
    /// Build an address for QUIC v1.
    pub fn new(socket: SocketAddr) -> Self {
        Self {
            socket,
            version_tag: QuicVersion::V1.tag().to_string(),
        }
    }

    /// The UDP socket address.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket
    }

    /// The address family.
    pub fn family(&self) -> Family {
        Family::of_addr(&self.socket)
    }

    /// Resolve the version tag to a supported QUIC version.
    ///
    /// Fails with [`Error::UnknownVersion`] for any tag other than
    /// `quic-v1`; callers check this before binding sockets.
    pub fn version(&self) -> Result<QuicVersion> {
        if self.version_tag == QuicVersion::V1.tag() {
            Ok(QuicVersion::V1)
        } else {
            Err(Error::UnknownVersion(self.version_tag.clone()))
        }
    }
}

impl fmt::Display for QuicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.socket {
            SocketAddr::V4(_) => "ip4",
            SocketAddr::V6(_) => "ip6",
        };
        write!(
            f,
            "/{}/{}/udp/{}/{}",
            proto,
            self.socket.ip(),
            self.socket.port(),
            self.version_tag
        )
    }
}

impl FromStr for QuicAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());

        let mut parts = s.split('/');
        if parts.next() != Some("") {
            return Err(invalid());
        }
        let ip_proto = parts.next().ok_or_else(invalid)?;
        let ip_str = parts.next().ok_or_else(invalid)?;
        let ip: IpAddr = match ip_proto {
            "ip4" => IpAddr::V4(ip_str.parse().map_err(|_| invalid())?),
            "ip6" => IpAddr::V6(ip_str.parse().map_err(|_| invalid())?),
            _ => return Err(invalid()),
        };
        if parts.next() != Some("udp") {
            return Err(invalid());
        }
        let port: u16 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let version_tag = parts.next().ok_or_else(invalid)?;
        if !version_tag.starts_with("quic") {
            return Err(invalid());
        }
        // Anything after the version tag (e.g. /alpn segments) does not
        // change the resolved address.

        Ok(QuicAddr {
            socket: SocketAddr::new(ip, port),
            version_tag: version_tag.to_string(),
        })
    }
}

impl From<SocketAddr> for QuicAddr {
    fn from(socket: SocketAddr) -> Self {
        QuicAddr::new(socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4() {
        let addr: QuicAddr = "/ip4/127.0.0.1/udp/4001/quic-v1".parse().unwrap();
        assert_eq!(addr.socket_addr(), "127.0.0.1:4001".parse().unwrap());
        assert_eq!(addr.family(), Family::Udp4);
        assert_eq!(addr.version().unwrap(), QuicVersion::V1);
    }

    #[test]
    fn parse_v6() {
        let addr: QuicAddr = "/ip6/::1/udp/9000/quic-v1".parse().unwrap();
        assert_eq!(addr.socket_addr(), "[::1]:9000".parse().unwrap());
        assert_eq!(addr.family(), Family::Udp6);
    }

    #[test]
    fn roundtrip_display() {
        for s in ["/ip4/0.0.0.0/udp/0/quic-v1", "/ip6/::/udp/443/quic-v1"] {
            let addr: QuicAddr = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn unknown_version_deferred_to_use() {
        let addr: QuicAddr = "/ip4/1.2.3.4/udp/9000/quic-draft-29".parse().unwrap();
        assert!(matches!(addr.version(), Err(Error::UnknownVersion(tag)) if tag == "quic-draft-29"));
    }

    #[test]
    fn trailing_segments_resolve_to_same_address() {
        for s in [
            "/ip4/127.0.0.1/udp/4001/quic-v1/alpn/h3",
            "/ip4/127.0.0.1/udp/4001/quic-v1/webtransport",
        ] {
            let addr: QuicAddr = s.parse().unwrap();
            assert_eq!(addr.socket_addr(), "127.0.0.1:4001".parse().unwrap());
            assert_eq!(addr.version().unwrap(), QuicVersion::V1);
        }
    }

    #[test]
    fn reject_malformed() {
        for s in [
            "",
            "/ip4/127.0.0.1/udp/4001",
            "/ip4/127.0.0.1/tcp/4001/quic-v1",
            "/ip4/::1/udp/4001/quic-v1",
            "/ip4/127.0.0.1/udp/4001/webtransport",
            "/ip4/127.0.0.1/udp/70000/quic-v1",
        ] {
            assert!(s.parse::<QuicAddr>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn family_helpers() {
        assert_eq!(Family::from_name("udp4").unwrap(), Family::Udp4);
        assert!(matches!(
            Family::from_name("tcp"),
            Err(Error::InvalidFamily(_))
        ));
        assert!(Family::Udp6.wildcard().ip().is_unspecified());
        assert!(Family::Udp4.contains(&"127.0.0.1:1".parse().unwrap()));
        assert!(!Family::Udp4.contains(&"[::1]:1".parse().unwrap()));
    }
}
