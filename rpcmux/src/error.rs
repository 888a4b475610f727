//! Server adapter errors.
//!
//! Protocol errors travel to clients as error frames; [`ServerError`] covers
//! failures of the socket plumbing itself, which are only logged.

/// Failure while moving frames between a session and its socket.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// An outbound frame could not be serialized.
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The socket rejected a write.
    #[error("socket error: {0}")]
    Socket(String),
}
