//! Connection model (spec §3 "Connection", §4.1 "Meta I/O", §4.2 "Meta
//! Protocol handshake state machine"). Grounded on the teacher's `Path`
//! (`zerotier-network-hypervisor/src/vl1/path.rs`) for the buffered-I/O
//! shape, adapted to a byte-oriented ring buffer (`VecDeque<u8>`) instead of
//! the legacy fixed-capacity C array, since `VecDeque` already gives
//! amortized O(1) push/pop without the manual start/len/capacity arithmetic.

use std::collections::VecDeque;
use std::net::SocketAddr;

use mesh_crypto::{EcdsaIdentity, RsaIdentity, SessionCipher};

/// The handshake permit: which verb(s) may legally arrive next on this
/// connection (spec §4.2). `Fatal` is not itself a permit state but a
/// sentinel recorded once a protocol violation has already been handled,
/// so double-termination is a no-op rather than a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowRequest {
    Id,
    MetaKey,
    Challenge,
    ChalReply,
    Ack,
    All,
}

#[derive(Debug, Default)]
pub struct ConnectionFlags {
    pub encrypt_in: bool,
    pub encrypt_out: bool,
    pub mst: bool,
    pub active: bool,
    pub pinged: bool,
    /// A control connection (opened by a local management client, e.g. the
    /// CLI) rather than a peer meta-session; retained through shutdown so
    /// the client observes the exit (spec §4.6 "Terminate semantics").
    pub control: bool,
}

/// A live meta-session, spec §3 "Connection". `id` is the registry's lookup
/// key; `peer_name` is populated once `ID` has been received.
#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub peer_name: Option<String>,
    pub peer_hostname: Option<String>,
    pub outgoing: bool,
    pub options: u32,
    pub flags: ConnectionFlags,
    pub allow_request: AllowRequest,

    pub inbound_decrypt: Option<SessionCipher>,
    pub outbound_encrypt: Option<SessionCipher>,
    pub in_seq: u32,
    pub out_seq: u32,

    /// Plaintext of the `CHALLENGE` we sent, held until `CHAL_REPLY` arrives
    /// to verify against (spec §4.2).
    pub pending_challenge: Option<Vec<u8>>,

    pub rsa_public_key: Option<RsaIdentity>,
    pub ecdsa_public_key: Option<EcdsaIdentity>,

    /// Bytes read off the socket but not yet parsed into a frame. Bounded by
    /// `MAXBUFSIZE` (spec §4.1); exceeding it without a frame boundary is
    /// fatal to the connection (spec §8 property 7).
    pub inbound: Vec<u8>,
    pub inbound_read_pos: usize,
    /// `Some(n)` while consuming `n` opaque bytes for a `PACKET` frame;
    /// `None` while scanning for the next newline-terminated request line.
    pub tcplen: Option<usize>,

    pub outbound: VecDeque<u8>,
    pub max_outbound: usize,

    pub last_ping_time: i64,
    pub last_flushed_time: i64,
    pub last_active: i64,
}

impl Connection {
    pub fn new(id: u64, peer_addr: SocketAddr, outgoing: bool, max_outbound: usize) -> Self {
        Self {
            id,
            peer_addr,
            peer_name: None,
            peer_hostname: None,
            outgoing,
            options: 0,
            flags: ConnectionFlags::default(),
            allow_request: AllowRequest::Id,
            inbound_decrypt: None,
            outbound_encrypt: None,
            in_seq: 0,
            out_seq: 0,
            pending_challenge: None,
            rsa_public_key: None,
            ecdsa_public_key: None,
            inbound: Vec::new(),
            inbound_read_pos: 0,
            tcplen: None,
            outbound: VecDeque::new(),
            max_outbound,
            last_ping_time: 0,
            last_flushed_time: 0,
            last_active: 0,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.peer_name.is_some() && self.flags.active
    }

    /// Append bytes to the outbound ring buffer, encrypting in place first
    /// if `encrypt_out` is set (spec §4.1 `send`). Returns an overflow error
    /// rather than growing past `max_outbound` (`MaxOutputBufferSize`).
    pub fn queue_send(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        let payload = if self.flags.encrypt_out {
            let cipher = self.outbound_encrypt.as_ref().expect("encrypt_out set without a cipher installed");
            let ct = cipher.encrypt(self.out_seq, bytes)?;
            self.out_seq = self.out_seq.wrapping_add(1);
            ct
        } else {
            bytes.to_vec()
        };
        if self.outbound.len() + payload.len() > self.max_outbound {
            return Err(crate::error::Error::BufferOverflow);
        }
        self.outbound.extend(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_send_rejects_past_max_outbound() {
        let mut c = Connection::new(1, "127.0.0.1:655".parse().unwrap(), true, 8);
        assert!(c.queue_send(b"12345678").is_ok());
        assert!(c.queue_send(b"x").is_err());
    }

    #[test]
    fn new_connection_starts_in_id_permit() {
        let c = Connection::new(1, "127.0.0.1:655".parse().unwrap(), true, 1024);
        assert_eq!(c.allow_request, AllowRequest::Id);
        assert!(!c.is_authenticated());
    }
}
