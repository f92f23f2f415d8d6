//! Name/address utilities (C1): sockaddr equality/copy across the resolved
//! and unresolved cases, hostname formatting, and the prefix-length masks
//! subnet matching needs. Grounded on the teacher's small `util` leaves
//! (`zerotier-network-hypervisor/src/util/mod.rs`) — a handful of
//! self-contained helpers rather than a single large type.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// A peer address as carried in config (`Address` lines) or learned from a
/// UDP datagram's source. Unlike `std::net::SocketAddr`, a `MeshAddr` may be
/// an unresolved hostname — spec §6's `Hostnames` option defers resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MeshAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Unresolved { host: String, port: u16 },
}

impl MeshAddr {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4(v4),
            SocketAddr::V6(v6) => Self::V6(v6),
        }
    }

    pub fn resolved(&self) -> Option<SocketAddr> {
        match self {
            Self::V4(v4) => Some(SocketAddr::V4(*v4)),
            Self::V6(v6) => Some(SocketAddr::V6(*v6)),
            Self::Unresolved { .. } => None,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::V4(v4) => v4.port(),
            Self::V6(v6) => v6.port(),
            Self::Unresolved { port, .. } => *port,
        }
    }

    /// Format for logs and scripts' `REMOTEADDRESS` environment variable:
    /// the bracket-free textual host, independent of whether it carries a
    /// port.
    pub fn host_string(&self) -> String {
        match self {
            Self::V4(v4) => v4.ip().to_string(),
            Self::V6(v6) => v6.ip().to_string(),
            Self::Unresolved { host, .. } => host.clone(),
        }
    }
}

impl fmt::Display for MeshAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(v4) => write!(f, "{}", v4),
            Self::V6(v6) => write!(f, "[{}]:{}", v6.ip(), v6.port()),
            Self::Unresolved { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Compares two addresses the way the legacy `sockaddrcmp()` does: by
/// resolved IP + port, with two unresolved hosts compared textually. Used by
/// SSSP (spec §4.3) to decide whether an observed address changed.
pub fn sockaddr_eq(a: &MeshAddr, b: &MeshAddr) -> bool {
    match (a.resolved(), b.resolved()) {
        (Some(ra), Some(rb)) => ra == rb,
        (None, None) => a.host_string() == b.host_string() && a.port() == b.port(),
        _ => false,
    }
}

/// Build an IPv4 netmask for a CIDR prefix length (0..=32).
pub fn ipv4_mask(prefix_len: u8) -> Ipv4Addr {
    let bits = prefix_len.min(32);
    let mask: u32 = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
    Ipv4Addr::from(mask)
}

/// Build an IPv6 netmask for a CIDR prefix length (0..=128).
pub fn ipv6_mask(prefix_len: u8) -> Ipv6Addr {
    let bits = prefix_len.min(128);
    let mask: u128 = if bits == 0 { 0 } else { u128::MAX << (128 - bits) };
    Ipv6Addr::from(mask)
}

pub fn ipv4_masked(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(addr) & u32::from(ipv4_mask(prefix_len)))
}

pub fn ipv6_masked(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Addr {
    Ipv6Addr::from(u128::from(addr) & u128::from(ipv6_mask(prefix_len)))
}

pub fn ip_masked(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => IpAddr::V4(ipv4_masked(v4, prefix_len)),
        IpAddr::V6(v6) => IpAddr::V6(ipv6_masked(v6, prefix_len)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_equality_ignores_representation() {
        let a = MeshAddr::from_socket_addr("10.0.0.1:655".parse().unwrap());
        let b = MeshAddr::from_socket_addr("10.0.0.1:655".parse().unwrap());
        assert!(sockaddr_eq(&a, &b));
    }

    #[test]
    fn unresolved_vs_resolved_never_equal() {
        let a = MeshAddr::Unresolved { host: "b.example".into(), port: 655 };
        let b = MeshAddr::from_socket_addr("10.0.0.1:655".parse().unwrap());
        assert!(!sockaddr_eq(&a, &b));
    }

    #[test]
    fn masks_zero_out_host_bits() {
        let addr: Ipv4Addr = "10.0.0.123".parse().unwrap();
        assert_eq!(ipv4_masked(addr, 24), "10.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ipv4_masked(addr, 0), "0.0.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ipv4_masked(addr, 32), addr);
    }
}
