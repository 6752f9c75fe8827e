//! Network endpoint types.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// A network endpoint (IP address + port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates a new endpoint from an IP address and port.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(addr, port))
    }

    /// Creates a new IPv4 endpoint.
    #[must_use]
    pub const fn new_v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(a, b, c, d),
            port,
        )))
    }

    /// Creates an endpoint bound to all interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self::new_v4(0, 0, 0, 0, port)
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new_v4(127, 0, 0, 1, port)
    }

    /// Resolves a configured host and port.
    ///
    /// `any` (any case) and the empty string mean all interfaces; otherwise
    /// `host` is an IP literal or a resolvable name, first IPv4 result wins.
    ///
    /// # Errors
    ///
    /// Name resolution failure or no IPv4 address.
    pub fn resolve(host: &str, port: u16) -> io::Result<Self> {
        let host = host.trim();
        if host.is_empty() || host.eq_ignore_ascii_case("any") {
            return Ok(Self::any(port));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::new(ip, port));
        }
        (host, port)
            .to_socket_addrs()?
            .find(SocketAddr::is_ipv4)
            .map(Self)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no IPv4 address for `{host}`"),
                )
            })
    }

    /// Returns the IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the underlying [`SocketAddr`].
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }

    /// The IPv4 address, if this is an IPv4 endpoint.
    #[must_use]
    pub const fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.0 {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.0
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self(SocketAddr::V4(addr))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_new_v4() {
        let ep = Endpoint::new_v4(192, 168, 1, 100, 8080);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)));
        assert_eq!(ep.port(), 8080);
    }

    #[test]
    fn endpoint_any() {
        let ep = Endpoint::any(9000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ep.port(), 9000);
    }

    #[test]
    fn endpoint_resolve_any_and_literal() {
        assert_eq!(Endpoint::resolve("any", 4001).unwrap(), Endpoint::any(4001));
        assert_eq!(Endpoint::resolve("ANY", 4001).unwrap(), Endpoint::any(4001));
        assert_eq!(
            Endpoint::resolve("10.0.3.1", 4002).unwrap(),
            Endpoint::new_v4(10, 0, 3, 1, 4002)
        );
    }

    #[test]
    fn endpoint_resolve_localhost_name() {
        let ep = Endpoint::resolve("localhost", 4003).unwrap();
        assert_eq!(ep.ipv4(), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn endpoint_display() {
        let ep = Endpoint::new_v4(127, 0, 0, 1, 8080);
        assert_eq!(format!("{ep}"), "127.0.0.1:8080");
    }
}
