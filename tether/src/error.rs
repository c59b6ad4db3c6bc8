//! Error types for tether.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TetherError>;

#[derive(Error, Debug)]
pub enum TetherError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("peer timed out")]
    PeerTimeout,
}

impl TetherError {
    /// True when the failure came from the socket rather than the protocol.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
