//! Error types for warden

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Request validation ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Membership preconditions ===
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Consensus / network ===
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    // === Storage ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("Encoding error: {0}")]
    Encoding(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a failure the operator may simply retry?
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Did the operation fail before mutating any state?
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::PreconditionFailed(_) | Error::NotFound(_)
        )
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}
