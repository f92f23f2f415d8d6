//! Packet I/O (C8), spec §4.5 and §6 "Wire protocol (data)". Builds and
//! parses the UDP datagram `seqno(4B BE) || ciphertext || mac(MACLength)`,
//! applying compression before encryption on send and after decryption on
//! receive. Replay-window validation lives on `Node` (see
//! `model::node::ReplayWindow`); this module is the thin encode/decode
//! layer around `mesh_crypto`.

use mesh_crypto::{CompressionLevel, SessionCipher, SessionMac};

use crate::error::{Error, Result};
use crate::model::node::Node;

pub const SEQNO_LEN: usize = 4;

/// Encode an outbound tunnel packet: compress, prepend seqno, encrypt,
/// append MAC (spec §4.5 "Outbound").
pub fn encode(cipher: &SessionCipher, mac: &SessionMac, compression: CompressionLevel, seqno: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
    let compressed = mesh_crypto::compress(compression, plaintext);
    let ciphertext = cipher.encrypt(seqno, &compressed)?;
    let tag = mac.compute(seqno, &ciphertext)?;

    let mut out = Vec::with_capacity(SEQNO_LEN + ciphertext.len() + tag.len());
    out.extend_from_slice(&seqno.to_be_bytes());
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decode and validate an inbound datagram against a specific node's
/// session state: checks the MAC, the replay window, then decrypts and
/// decompresses (spec §4.5 "Inbound", §8 property 6).
pub fn decode(node: &mut Node, cipher: &SessionCipher, mac: &SessionMac, compression: CompressionLevel, datagram: &[u8], max_plaintext: usize) -> Result<Vec<u8>> {
    if datagram.len() < SEQNO_LEN + mac.mac_len() {
        return Err(Error::Protocol("datagram shorter than seqno+mac".into()));
    }
    let seqno = u32::from_be_bytes(datagram[0..SEQNO_LEN].try_into().unwrap());
    let tag_start = datagram.len() - mac.mac_len();
    let ciphertext = &datagram[SEQNO_LEN..tag_start];
    let tag = &datagram[tag_start..];

    if !mac.verify(seqno, ciphertext, tag)? {
        return Err(Error::Protocol("MAC verification failed".into()));
    }
    if !node.session.replay_window.accept(seqno) {
        return Err(Error::Protocol(format!("replayed or stale seqno {}", seqno)));
    }

    let compressed = cipher.decrypt(seqno, ciphertext)?;
    let plaintext = mesh_crypto::decompress(compression, &compressed, max_plaintext)?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_crypto::{CipherKind, DigestKind};

    #[test]
    fn encode_decode_roundtrip() {
        let cipher = SessionCipher::new(CipherKind::Blowfish, &[0x11; 16]);
        let mac = SessionMac::new(DigestKind::Sha1, b"mackey", 4);
        let level = CompressionLevel(0);
        let payload = b"an ethernet frame's worth of bytes, give or take";

        let wire = encode(&cipher, &mac, level, 1, payload).unwrap();

        let mut node = Node::new("peer");
        let decoded = decode(&mut node, &cipher, &mac, level, &wire, payload.len() + 64).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let cipher = SessionCipher::new(CipherKind::Blowfish, &[0x22; 16]);
        let mac = SessionMac::new(DigestKind::Sha1, b"mackey", 4);
        let level = CompressionLevel(0);
        let mut wire = encode(&cipher, &mac, level, 1, b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;

        let mut node = Node::new("peer");
        assert!(decode(&mut node, &cipher, &mac, level, &wire, 64).is_err());
    }

    #[test]
    fn replayed_seqno_is_rejected_on_second_delivery() {
        let cipher = SessionCipher::new(CipherKind::Blowfish, &[0x33; 16]);
        let mac = SessionMac::new(DigestKind::Sha1, b"mackey", 4);
        let level = CompressionLevel(0);
        let wire = encode(&cipher, &mac, level, 5, b"hello").unwrap();

        let mut node = Node::new("peer");
        assert!(decode(&mut node, &cipher, &mac, level, &wire, 64).is_ok());
        assert!(decode(&mut node, &cipher, &mac, level, &wire, 64).is_err());
    }
}
