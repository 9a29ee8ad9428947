use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Destination of a tunneled flow as seen by the relay.
///
/// IPv4 is what the TUN side produces; the domain and IPv6 forms exist so
/// the tunnel can address anything VLESS can express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl DestAddr {
    pub fn ipv4(addr: Ipv4Addr, port: u16) -> Self {
        DestAddr::Ip(SocketAddr::new(IpAddr::V4(addr), port))
    }

    pub fn ipv6(addr: Ipv6Addr, port: u16) -> Self {
        DestAddr::Ip(SocketAddr::new(IpAddr::V6(addr), port))
    }

    /// Classify a textual host. IPv4 and IPv6 literals (including the
    /// `::` abbreviation) become addresses; anything else is a domain.
    pub fn from_host(host: &str, port: u16) -> Self {
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Self::ipv4(v4, port);
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return Self::ipv6(v6, port);
        }
        DestAddr::Domain(host.to_string(), port)
    }

    pub fn port(&self) -> u16 {
        match self {
            DestAddr::Ip(addr) => addr.port(),
            DestAddr::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            DestAddr::Ip(addr) => addr.ip().to_string(),
            DestAddr::Domain(domain, _) => domain.clone(),
        }
    }
}

impl fmt::Display for DestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestAddr::Ip(addr) => write!(f, "{}", addr),
            DestAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
