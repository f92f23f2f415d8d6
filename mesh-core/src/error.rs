//! Crate-level error type, grounded on the teacher's hand-rolled `Error` enum
//! in `core-crypto/src/zssp.rs` (manual Display/Debug, no thiserror).

#[derive(Debug)]
pub enum Error {
    /// A config or host file was malformed (spec §7 "configuration errors").
    Config(String),

    /// Framing, permit, or authentication violation on a meta connection
    /// (spec §7 "protocol errors"). Always fatal to the connection it occurred on.
    Protocol(String),

    /// The inbound meta buffer reached `MAXBUFSIZE` without a frame boundary.
    BufferOverflow,

    /// The crypto collaborator rejected an operation (bad MAC, bad signature, bad key).
    Crypto(mesh_crypto::Error),

    Io(std::io::Error),

    /// Anything else, boxed so call sites don't need a matching variant.
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<mesh_crypto::Error> for Error {
    fn from(e: mesh_crypto::Error) -> Self {
        Self::Crypto(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {}", s),
            Self::Protocol(s) => write!(f, "protocol error: {}", s),
            Self::BufferOverflow => f.write_str("meta buffer overflow"),
            Self::Crypto(e) => write!(f, "crypto error: {}", e),
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
