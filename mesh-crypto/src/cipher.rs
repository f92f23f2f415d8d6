//! Symmetric cipher and MAC interfaces. `ADD_EDGE`/`METAKEY` negotiate a
//! `CipherKind` and `DigestKind` by name (spec §6 `Cipher`/`Digest`/`MACLength`
//! options); the packet I/O layer (C8) uses whatever was negotiated without
//! caring about the concrete algorithm.

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::symm::{Cipher as OsslCipher, Crypter, Mode};

use crate::error::{Error, Result};

/// Named symmetric ciphers. Spec §6 default is `"blowfish"`; AES is offered
/// for sites that prefer it. Grounded on `aes-gmac-siv/src/impl_openssl.rs`,
/// which drives the same `openssl::symm` API for AES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Blowfish,
    Aes256Cbc,
    /// `Cipher = none` disables payload encryption (MAC-only channels).
    None,
}

impl CipherKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blowfish" => Some(Self::Blowfish),
            "aes-256-cbc" | "aes256" => Some(Self::Aes256Cbc),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blowfish => "blowfish",
            Self::Aes256Cbc => "aes-256-cbc",
            Self::None => "none",
        }
    }

    fn openssl_cipher(&self) -> Option<OsslCipher> {
        match self {
            Self::Blowfish => Some(OsslCipher::bf_cbc()),
            Self::Aes256Cbc => Some(OsslCipher::aes_256_cbc()),
            Self::None => None,
        }
    }

    pub fn key_len(&self) -> usize {
        self.openssl_cipher().map_or(0, |c| c.key_len())
    }

    pub fn iv_len(&self) -> usize {
        self.openssl_cipher().map_or(0, |c| c.iv_len().unwrap_or(0))
    }
}

/// Stream-style in-place symmetric encryption driven by a per-session key.
/// `seqno` supplies the per-packet IV material the way spec §4.5 lays the
/// UDP wire format out: `seqno || ciphertext || mac`.
#[derive(Debug)]
pub struct SessionCipher {
    kind: CipherKind,
    key: Vec<u8>,
}

impl SessionCipher {
    pub fn new(kind: CipherKind, key: &[u8]) -> Self {
        Self { kind, key: key.to_vec() }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    fn iv_from_seqno(&self, seqno: u32) -> Vec<u8> {
        let mut iv = vec![0_u8; self.kind.iv_len()];
        if !iv.is_empty() {
            let sb = seqno.to_be_bytes();
            let n = sb.len().min(iv.len());
            iv[iv.len() - n..].copy_from_slice(&sb[sb.len() - n..]);
        }
        iv
    }

    /// Encrypt `plaintext` in place, returning the ciphertext (which may be
    /// longer than the input due to block padding).
    pub fn encrypt(&self, seqno: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.kind.openssl_cipher() {
            None => Ok(plaintext.to_vec()),
            Some(c) => {
                let iv = self.iv_from_seqno(seqno);
                let mut crypter = Crypter::new(c, Mode::Encrypt, &self.key, Some(&iv))?;
                crypter.pad(true);
                let mut out = vec![0_u8; plaintext.len() + c.block_size()];
                let mut count = crypter.update(plaintext, &mut out)?;
                count += crypter.finalize(&mut out[count..])?;
                out.truncate(count);
                Ok(out)
            }
        }
    }

    pub fn decrypt(&self, seqno: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        match self.kind.openssl_cipher() {
            None => Ok(ciphertext.to_vec()),
            Some(c) => {
                let iv = self.iv_from_seqno(seqno);
                let mut crypter = Crypter::new(c, Mode::Decrypt, &self.key, Some(&iv))?;
                crypter.pad(true);
                let mut out = vec![0_u8; ciphertext.len() + c.block_size()];
                let mut count = crypter.update(ciphertext, &mut out).map_err(|_| Error::AuthenticationFailed)?;
                count += crypter.finalize(&mut out[count..]).map_err(|_| Error::AuthenticationFailed)?;
                out.truncate(count);
                Ok(out)
            }
        }
    }
}

/// Named digests used to derive the session MAC. Spec §6 default is
/// `"sha1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestKind {
    Sha1,
    Sha256,
}

impl DigestKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
        }
    }
}

/// HMAC(digest) over `seqno_be || ciphertext`, truncated to `MACLength`
/// bytes (spec §6 `MACLength`, default 4).
#[derive(Debug)]
pub struct SessionMac {
    digest: DigestKind,
    key: Vec<u8>,
    mac_len: usize,
}

impl SessionMac {
    pub fn new(digest: DigestKind, key: &[u8], mac_len: usize) -> Self {
        Self { digest, key: key.to_vec(), mac_len }
    }

    pub fn mac_len(&self) -> usize {
        self.mac_len
    }

    pub fn compute(&self, seqno: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if self.mac_len == 0 {
            return Ok(Vec::new());
        }
        let pkey = PKey::hmac(&self.key)?;
        let mut signer = Signer::new(self.digest.message_digest(), &pkey)?;
        signer.update(&seqno.to_be_bytes())?;
        signer.update(ciphertext)?;
        let full = signer.sign_to_vec()?;
        Ok(full[0..self.mac_len.min(full.len())].to_vec())
    }

    pub fn verify(&self, seqno: u32, ciphertext: &[u8], tag: &[u8]) -> Result<bool> {
        if self.mac_len == 0 {
            return Ok(tag.is_empty());
        }
        let expected = self.compute(seqno, ciphertext)?;
        Ok(openssl::memcmp::eq(&expected, tag))
    }
}

/// SHA-1 of `data` as lowercase hex, used for the legacy `CHALLENGE`/
/// `CHAL_REPLY` handshake (spec §4.2: `CHAL_REPLY` is `SHA1(challenge)`).
pub fn sha1_hex(data: &[u8]) -> String {
    use openssl::hash::{Hasher, MessageDigest};
    let mut h = Hasher::new(MessageDigest::sha1()).expect("sha1 is always available");
    h.update(data).expect("hasher update cannot fail");
    let digest = h.finish().expect("hasher finish cannot fail");
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blowfish_roundtrip() {
        let key = [0x42_u8; 16];
        let c = SessionCipher::new(CipherKind::Blowfish, &key);
        let pt = b"a mesh packet payload of moderate length, enough to span blocks";
        let ct = c.encrypt(7, pt).unwrap();
        let back = c.decrypt(7, &ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn mac_detects_tamper() {
        let mac = SessionMac::new(DigestKind::Sha1, b"sekrit", 4);
        let tag = mac.compute(1, b"hello").unwrap();
        assert!(mac.verify(1, b"hello", &tag).unwrap());
        assert!(!mac.verify(1, b"hellO", &tag).unwrap());
        assert!(!mac.verify(2, b"hello", &tag).unwrap());
    }

    #[test]
    fn none_cipher_is_passthrough() {
        let c = SessionCipher::new(CipherKind::None, &[]);
        let pt = b"plain";
        assert_eq!(c.encrypt(0, pt).unwrap(), pt);
    }
}
