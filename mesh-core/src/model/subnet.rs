//! Subnet model (spec §3 "Subnet") and its wire text encoding, pinned down
//! by `original_source/src/netutl.c`'s mask helpers and the `ADD_SUBNET`
//! format referenced from `protocol_subnet.c`: MAC subnets serialize as
//! `xx:xx:xx:xx:xx:xx`, IPv4 as `a.b.c.d/n`, IPv6 as `addr/n`, each
//! optionally followed by `#weight`.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::util::sockaddr::{ipv4_masked, ipv6_masked};

pub const WEIGHT_DEFAULT: u16 = 0;
pub const EXPIRES_PERMANENT: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address: {}", s));
        }
        let mut out = [0_u8; 6];
        for (i, p) in parts.iter().enumerate() {
            out[i] = u8::from_str_radix(p, 16).map_err(|_| format!("invalid MAC octet: {}", p))?;
        }
        Ok(MacAddr(out))
    }
}

/// The tagged subnet variant spec §3 describes. Equality/ordering is by the
/// address key only — `owner`/`weight`/`expires` are metadata, not part of
/// the key two nodes compare when deciding whether an advertisement is a
/// duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubnetKey {
    Mac(MacAddr),
    Ipv4 { addr: Ipv4Addr, prefix_len: u8 },
    Ipv6 { addr: Ipv6Addr, prefix_len: u8 },
}

impl SubnetKey {
    /// Normalize host bits to zero, the way `str2net`/`maskcpy` do on parse
    /// so two textually-different-but-overlapping advertisements compare
    /// equal once masked.
    pub fn normalized(self) -> Self {
        match self {
            Self::Mac(m) => Self::Mac(m),
            Self::Ipv4 { addr, prefix_len } => Self::Ipv4 { addr: ipv4_masked(addr, prefix_len), prefix_len },
            Self::Ipv6 { addr, prefix_len } => Self::Ipv6 { addr: ipv6_masked(addr, prefix_len), prefix_len },
        }
    }

    /// Longest-prefix match helper for the router routing mode (spec §4.4):
    /// does `ip` fall within this subnet?
    pub fn contains_ipv4(&self, ip: Ipv4Addr) -> bool {
        matches!(self, Self::Ipv4 { addr, prefix_len } if ipv4_masked(ip, *prefix_len) == *addr)
    }

    pub fn contains_ipv6(&self, ip: Ipv6Addr) -> bool {
        matches!(self, Self::Ipv6 { addr, prefix_len } if ipv6_masked(ip, *prefix_len) == *addr)
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            Self::Mac(_) => 48,
            Self::Ipv4 { prefix_len, .. } => *prefix_len,
            Self::Ipv6 { prefix_len, .. } => *prefix_len,
        }
    }
}

impl fmt::Display for SubnetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mac(m) => write!(f, "{}", m),
            Self::Ipv4 { addr, prefix_len } => write!(f, "{}/{}", addr, prefix_len),
            Self::Ipv6 { addr, prefix_len } => write!(f, "{}/{}", addr, prefix_len),
        }
    }
}

impl FromStr for SubnetKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') && !s.contains('/') {
            return Ok(Self::Mac(s.parse()?));
        }
        if let Some((addr_part, prefix_part)) = s.split_once('/') {
            let prefix_len: u8 = prefix_part.parse().map_err(|_| format!("invalid prefix length: {}", prefix_part))?;
            if let Ok(v4) = addr_part.parse::<Ipv4Addr>() {
                return Ok(Self::Ipv4 { addr: ipv4_masked(v4, prefix_len), prefix_len });
            }
            if let Ok(v6) = addr_part.parse::<Ipv6Addr>() {
                return Ok(Self::Ipv6 { addr: ipv6_masked(v6, prefix_len), prefix_len });
            }
            return Err(format!("unparsable subnet address: {}", addr_part));
        }
        Err(format!("malformed subnet string: {}", s))
    }
}

/// A subnet advertisement, spec §3: tagged key, owning node, tie-break
/// weight, and absolute expiry (`-1` = permanent).
#[derive(Debug, Clone)]
pub struct Subnet {
    pub key: SubnetKey,
    pub owner: String,
    pub weight: u16,
    pub expires: i64,
    /// MAC subnets additionally track the last time this address was
    /// observed from a tap-device read, for switch-mode learning expiry
    /// (spec §4.4 `MACExpire`).
    pub last_seen: Option<i64>,
}

impl Subnet {
    pub fn new(key: SubnetKey, owner: impl Into<String>) -> Self {
        Self { key: key.normalized(), owner: owner.into(), weight: WEIGHT_DEFAULT, expires: EXPIRES_PERMANENT, last_seen: None }
    }

    pub fn is_permanent(&self) -> bool {
        self.expires == EXPIRES_PERMANENT
    }

    pub fn is_expired(&self, now: i64) -> bool {
        !self.is_permanent() && self.expires < now
    }

    /// Full wire encoding for `ADD_SUBNET`/`DEL_SUBNET`: `key#weight` when
    /// weight is non-default, else just `key`.
    pub fn to_wire_string(&self) -> String {
        if self.weight == WEIGHT_DEFAULT {
            self.key.to_string()
        } else {
            format!("{}#{}", self.key, self.weight)
        }
    }

    pub fn parse_wire_string(owner: impl Into<String>, s: &str) -> Result<Self, String> {
        let (key_part, weight) = match s.split_once('#') {
            Some((k, w)) => (k, w.parse::<u16>().map_err(|_| format!("invalid subnet weight: {}", w))?),
            None => (s, WEIGHT_DEFAULT),
        };
        let key: SubnetKey = key_part.parse()?;
        let mut subnet = Subnet::new(key, owner);
        subnet.weight = weight;
        Ok(subnet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_roundtrips() {
        let key: SubnetKey = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(key.to_string(), "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn ipv4_roundtrips_and_masks_host_bits() {
        let key: SubnetKey = "10.0.0.123/24".parse().unwrap();
        assert_eq!(key.to_string(), "10.0.0.0/24");
        assert!(key.contains_ipv4("10.0.0.7".parse().unwrap()));
        assert!(!key.contains_ipv4("10.0.1.7".parse().unwrap()));
    }

    #[test]
    fn weight_suffix_roundtrips() {
        let s = Subnet::parse_wire_string("a", "10.0.0.0/24#5").unwrap();
        assert_eq!(s.weight, 5);
        assert_eq!(s.to_wire_string(), "10.0.0.0/24#5");
    }

    #[test]
    fn default_weight_has_no_suffix() {
        let s = Subnet::parse_wire_string("a", "10.0.0.0/24").unwrap();
        assert_eq!(s.to_wire_string(), "10.0.0.0/24");
    }
}
