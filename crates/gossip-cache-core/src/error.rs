//! Error types for gossip-cache

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// gossip-cache encoding errors
#[derive(Debug, Error)]
pub enum Error {
    /// Inter-node payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Client-facing JSON could not be encoded or decoded
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload decoded but left unread bytes behind
    #[error("trailing bytes after message: {0}")]
    TrailingBytes(usize),
}
