//! Error type for the crypto boundary, grounded on the teacher's hand-rolled
//! `Error` enum in `core-crypto/src/zssp.rs` (manual Display/Debug, no
//! thiserror).

#[derive(Debug)]
pub enum Error {
    /// An OpenSSL operation failed. The wrapped stack is kept for diagnostics.
    OpenSsl(openssl::error::ErrorStack),

    /// A PEM blob did not parse, or parsed to a key of the wrong kind.
    InvalidKey,

    /// A MAC or signature did not match.
    AuthenticationFailed,

    /// Compressed input expanded past the caller-supplied bound, or was malformed.
    DecompressionFailed,

    /// A buffer too small to hold its data was supplied.
    BufferTooSmall,
}

impl From<openssl::error::ErrorStack> for Error {
    #[cold]
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::OpenSsl(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenSsl(e) => write!(f, "openssl error: {}", e),
            Self::InvalidKey => f.write_str("invalid or unparsable key material"),
            Self::AuthenticationFailed => f.write_str("MAC or signature verification failed"),
            Self::DecompressionFailed => f.write_str("decompression failed or exceeded bound"),
            Self::BufferTooSmall => f.write_str("destination buffer too small"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
