//! Node model (spec §3 "Node"). Grounded on the teacher's `Peer`
//! (`zerotier-network-hypervisor/src/vl1/peer.rs`): per-peer crypto state,
//! atomics for counters, and a small options bitmask rather than a struct of
//! booleans — matching `Peer`'s style of packing session flags.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use mesh_crypto::{CipherKind, DigestKind, SessionCipher, SessionMac};

use crate::model::subnet::SubnetKey;
use crate::util::sockaddr::MeshAddr;

/// Node option bits, spec §3: "options bitmask (INDIRECT, TCPONLY,
/// PMTU_DISCOVERY, CLAMP_MSS, a minor-protocol-version field in high byte)".
pub mod opt {
    pub const INDIRECT: u32 = 0x0001;
    pub const TCPONLY: u32 = 0x0002;
    pub const PMTU_DISCOVERY: u32 = 0x0004;
    pub const CLAMP_MSS: u32 = 0x0008;
    /// Minor protocol version packed into bits 24..32, mirroring the legacy
    /// "high byte" layout.
    pub const MINOR_VERSION_SHIFT: u32 = 24;

    pub fn minor_version(options: u32) -> u8 {
        (options >> MINOR_VERSION_SHIFT) as u8
    }

    pub fn with_minor_version(options: u32, minor: u8) -> u32 {
        (options & 0x00FF_FFFF) | ((minor as u32) << MINOR_VERSION_SHIFT)
    }
}

pub const DEFAULT_MTU: u16 = 1500;

/// Path-MTU discovery state (spec §3, §4.4).
#[derive(Debug, Default)]
pub struct MtuProbeState {
    pub probes_sent: u32,
    pub min_mtu: u16,
    pub max_mtu: u16,
}

impl MtuProbeState {
    pub fn reset(&mut self) {
        self.probes_sent = 0;
        self.min_mtu = 0;
        self.max_mtu = DEFAULT_MTU;
    }

    pub fn converged(&self) -> bool {
        self.max_mtu.saturating_sub(self.min_mtu) <= 1
    }
}

/// A 64-bit replay window bitmap, spec §4.5/§8 property 6. Bit 0 tracks
/// `high_watermark`; bit `i` tracks `high_watermark - i`.
#[derive(Debug)]
pub struct ReplayWindow {
    width: u32,
    bitmap: u64,
    high_watermark: Option<u32>,
}

impl ReplayWindow {
    pub fn new(width: u32) -> Self {
        Self { width: width.min(64), bitmap: 0, high_watermark: None }
    }

    /// Returns true and records `seq` if it is acceptable (spec §4.5):
    /// strictly newer advances the watermark; within-window-and-unseen sets
    /// the bit; everything else is a replay or too old.
    pub fn accept(&mut self, seq: u32) -> bool {
        let hw = match self.high_watermark {
            None => {
                self.high_watermark = Some(seq);
                self.bitmap = 1;
                return true;
            }
            Some(hw) => hw,
        };
        if seq > hw {
            let advance = (seq - hw) as u64;
            self.bitmap = if advance >= 64 { 0 } else { self.bitmap << advance };
            self.bitmap |= 1;
            self.high_watermark = Some(seq);
            return true;
        }
        let age = (hw - seq) as u64;
        if age == 0 || age >= self.width as u64 {
            return false;
        }
        let bit = 1_u64 << age;
        if self.bitmap & bit != 0 {
            return false;
        }
        self.bitmap |= bit;
        true
    }
}

/// Session counters kept as atomics so a status query from outside the
/// reactor thread (e.g. a CLI `status` command backed by `dashmap`) never
/// needs to lock, mirroring `Peer`'s `AtomicI64` last-receive/send fields.
#[derive(Debug, Default)]
pub struct NodeCounters {
    pub out_seqno: AtomicU32,
    pub last_ping_time: AtomicI64,
    pub last_seen: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFlavor {
    /// Legacy RSA METAKEY/CHALLENGE handshake.
    Legacy,
    /// Experimental ECDSA-signed SPTPS handshake (spec §4.2).
    Sptps,
}

/// Per-session negotiated crypto and protocol state for a node, separated
/// from the always-present identity fields above it in `Node`.
#[derive(Debug)]
pub struct SessionState {
    pub reachable: bool,
    pub indirect: bool,
    pub valid_key: bool,
    pub waiting_for_key: bool,
    pub flavor: SessionFlavor,
    pub cipher: Option<CipherKind>,
    pub digest: Option<DigestKind>,
    pub mac_len: usize,
    pub compression_level: u8,
    pub replay_window: ReplayWindow,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            reachable: false,
            indirect: false,
            valid_key: false,
            waiting_for_key: false,
            flavor: SessionFlavor::Legacy,
            cipher: None,
            digest: None,
            mac_len: 4,
            compression_level: 0,
            replay_window: ReplayWindow::new(32),
        }
    }
}

/// A peer in the mesh, spec §3 "Node". `name` is the stable identity;
/// `nexthop`/`via` are by-name since the owning `Registry` indexes nodes by
/// name and a `&Node` borrow would fight the graph recompute.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub rsa_public_key_pem: Option<Vec<u8>>,
    pub ecdsa_public_key_pem: Option<Vec<u8>>,
    pub address: Option<MeshAddr>,
    pub hostname: Option<String>,
    pub options: u32,
    pub nexthop: String,
    pub via: String,
    pub session: SessionState,
    /// Data-channel (UDP/TCP-fallback) session key installed via
    /// `REQ_KEY`/`ANS_KEY` (spec §4.2, §4.5) — distinct from a
    /// `Connection`'s `inbound_decrypt`/`outbound_encrypt`, which back the
    /// meta-channel key installed via `METAKEY`.
    pub udp_cipher: Option<SessionCipher>,
    pub udp_mac: Option<SessionMac>,
    pub mtu_probe: MtuProbeState,
    pub counters: NodeCounters,
    pub owned_subnets: HashSet<SubnetKey>,
    pub known_edges: HashSet<String>,
    pub has_connection: AtomicBool,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            nexthop: name.clone(),
            via: name.clone(),
            name,
            rsa_public_key_pem: None,
            ecdsa_public_key_pem: None,
            address: None,
            hostname: None,
            options: 0,
            session: SessionState::default(),
            udp_cipher: None,
            udp_mac: None,
            mtu_probe: {
                let mut s = MtuProbeState::default();
                s.reset();
                s
            },
            counters: NodeCounters::default(),
            owned_subnets: HashSet::new(),
            known_edges: HashSet::new(),
            has_connection: AtomicBool::new(false),
        }
    }

    pub fn is_self_reachable(&self, self_name: &str) -> bool {
        self.name == self_name || self.session.reachable
    }

    pub fn is_direct(&self, self_name: &str) -> bool {
        self.nexthop == self_name
    }

    pub fn mark_has_connection(&self, value: bool) {
        self.has_connection.store(value, Ordering::Relaxed);
    }

    pub fn touch_seen(&self, now: i64) {
        self.counters.last_seen.store(now, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_window_accepts_monotonic_then_rejects_repeats() {
        let mut w = ReplayWindow::new(32);
        for seq in 1..=50 {
            assert!(w.accept(seq));
        }
        assert!(w.accept(20));
        assert!(!w.accept(20));
        assert!(!w.accept(10));
    }

    #[test]
    fn replay_window_out_of_order_within_window_accepted_once() {
        let mut w = ReplayWindow::new(8);
        assert!(w.accept(10));
        assert!(w.accept(9));
        assert!(!w.accept(9));
        assert!(w.accept(12));
        assert!(w.accept(11));
    }

    #[test]
    fn minor_version_packs_into_high_byte() {
        let opts = opt::with_minor_version(opt::INDIRECT, 3);
        assert_eq!(opt::minor_version(opts), 3);
        assert_eq!(opts & opt::INDIRECT, opt::INDIRECT);
    }
}
