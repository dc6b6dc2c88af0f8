use thiserror::Error;

use super::token::AllocationError;

/// Errors returned synchronously by the connection registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Peer address and port both missing, or a nil token
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Copying the peer address failed before the entry was linked in
    #[error("out of memory while creating mapping entry")]
    OutOfMemory,

    /// The registry already holds its maximum number of peers
    #[error("peer table full ({0} peers)")]
    Capacity(usize),

    #[error("no mapping entry matches the token")]
    NotFound,

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
