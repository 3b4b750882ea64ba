//! Coordination Error Types

use thiserror::Error;

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coordination error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Store errors
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Disconnected from coordination store")]
    Disconnected,

    #[error("Session expired")]
    SessionExpired,

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("No such node: {0}")]
    NoNode(String),

    #[error("Node has children: {0}")]
    NotEmpty(String),

    #[error("Ephemeral node cannot have children: {0}")]
    EphemeralParent(String),

    // Protocol errors
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariant(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is transient and the operation may be retried
    /// once the connection comes back
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Disconnected)
    }

    /// Check if this error means every ephemeral node of the session is gone
    /// and membership must be rebuilt
    pub fn requires_rejoin(&self) -> bool {
        matches!(self, Error::SessionExpired)
    }

    /// Check if this error must be surfaced to the operator instead of retried
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProtocolInvariant(_) | Error::NodeExists(_))
    }
}
