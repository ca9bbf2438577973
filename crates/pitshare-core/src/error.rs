//! Error types for Pitshare

use thiserror::Error;

/// Main error type for team-sharing operations
#[derive(Error, Debug)]
pub enum ShareError {
    /// The requested endpoint identity is already held by another endpoint
    #[error("Identity already taken: {0}")]
    IdentityTaken(String),

    /// The local endpoint could not be created or failed while running
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// A remote identity could not be reached
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// A single peer link failed
    #[error("Connection to {peer} failed: {reason}")]
    Connection {
        /// Remote identity of the failed link
        peer: String,
        /// Human-readable cause
        reason: String,
    },

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The peer spoke a different wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend status bridge failure
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ShareError {
    fn from(err: serde_json::Error) -> Self {
        ShareError::Serialization(err.to_string())
    }
}

impl ShareError {
    /// Whether this error ends the whole endpoint session rather than one link
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShareError::IdentityTaken(_) | ShareError::Endpoint(_) | ShareError::Network(_)
        )
    }
}

/// Result type alias using ShareError
pub type ShareResult<T> = Result<T, ShareError>;
