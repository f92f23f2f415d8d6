//! Cryptographic boundary for the mesh VPN daemon.
//!
//! This crate isolates every call into OpenSSL and lz4_flex behind small,
//! concrete types so the rest of the tree (`mesh-core`) never touches a raw
//! cipher context: `SessionCipher`/`SessionMac` for the per-peer UDP/TCP data
//! channel, `compress`/`decompress` for the payload pre-processing step, and
//! `RsaIdentity`/`EcdsaIdentity` for long-term host keys and handshakes.

pub mod cipher;
pub mod compress;
pub mod error;
pub mod keypair;

pub use cipher::{sha1_hex, CipherKind, DigestKind, SessionCipher, SessionMac};
pub use compress::{compress, decompress, CompressionLevel};
pub use error::{Error, Result};
pub use keypair::{EcdsaIdentity, RsaIdentity};
