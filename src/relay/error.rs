use std::time::Duration;
use thiserror::Error;

use crate::registry::{RegistryError, Token};

/// Malformed or unexpected tunnel frame
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message length mismatch: declared={declared} actual={actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unexpected envelope type '{0}'")]
    UnexpectedType(String),

    #[error("envelope token {received} does not match session token {expected}")]
    TokenMismatch { expected: Token, received: Token },
}

/// A tunnel could not be attached to its peer's entry
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The peer's entry kept changing under concurrent connects
    #[error("could not attach tunnel for {ip}:{port}: entry replaced concurrently")]
    Contended { ip: String, port: u16 },
}

/// Outcome of a forwarded request that produced no response body
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Peer did not answer in time. The entry is left in place.
    #[error("no response from peer within {0:?}")]
    Timeout(Duration),

    /// The peer's tunnel closed while the request was waiting
    #[error("peer disconnected before responding")]
    Cancelled,

    #[error("tunnel unavailable: {0}")]
    Unavailable(&'static str),

    #[error(transparent)]
    Encode(#[from] WireError),
}

impl DispatchError {
    /// Textual status reported to REST clients
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Registry(RegistryError::InvalidArgument(_)) => "invalid_argument",
            DispatchError::Registry(RegistryError::Capacity(_)) => "unavailable",
            DispatchError::Registry(_) | DispatchError::Encode(_) => "internal",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Cancelled => "cancelled",
            DispatchError::Unavailable(_) => "unavailable",
        }
    }
}
