//! WolfPack Error Types

use thiserror::Error;

use crate::coordination::SessionId;

/// Result type alias for WolfPack operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfPack error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination service errors
    #[error("Coordination service unavailable: {0}")]
    CoordinationUnavailable(String),

    #[error("Coordination session {0} expired")]
    SessionExpired(SessionId),

    #[error("Path already exists: {0}")]
    NodeExists(String),

    #[error("Path does not exist: {0}")]
    NoNode(String),

    // Leadership and membership errors
    #[error("No leader has been elected yet")]
    NotYetElected,

    #[error("Registration of {address} failed: {reason}")]
    Registration { address: String, reason: String },

    // Write path errors
    #[error("Routing failure: {0}")]
    Routing(String),

    #[error("Replication to {address} failed: {reason}")]
    ReplicationDelivery { address: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CoordinationUnavailable(_) | Error::Network(_)
        )
    }

    /// Check if this error means the coordination session is gone
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Error::SessionExpired(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}
