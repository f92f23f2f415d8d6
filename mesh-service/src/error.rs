//! Crate-level error type, grounded on `mesh_core::error::Error`'s same
//! hand-rolled pattern (manual Display, no thiserror).

#[derive(Debug)]
pub enum Error {
    Config(String),
    Io(std::io::Error),
    Crypto(mesh_crypto::Error),
    Core(mesh_core::Error),
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

impl From<mesh_core::Error> for Error {
    fn from(e: mesh_core::Error) -> Self {
        Self::Core(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(s) => write!(f, "configuration error: {}", s),
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Crypto(e) => write!(f, "crypto error: {}", e),
            Self::Core(e) => write!(f, "core error: {}", e),
            Self::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
