//! # Sync Error Types
//!
//! Centralized error handling for the sync core library.

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Core error types for the sync engine
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network unreachable or connection dropped
    #[error("Network error: {0}")]
    Network(String),

    /// Remote did not answer in time
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Remote asked us to slow down
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Server-side failure (5xx class)
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Request rejected by the remote (4xx class)
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Durable storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// No delivery function registered for an operation kind
    #[error("No delivery handler for kind: {0}")]
    NoDeliveryHandler(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic errors with context
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Create a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new rate-limit error
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        Self::RateLimited(msg.into())
    }

    /// Create a new server-side error
    pub fn server(status: u16, msg: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: msg.into(),
        }
    }

    /// Create a new rejection error
    pub fn rejected(status: u16, msg: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: msg.into(),
        }
    }

    /// Create a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error is worth retrying under the default policy.
    ///
    /// Network drops, timeouts, rate limits and 5xx responses are
    /// transient; everything else is terminal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Server { .. }
        )
    }

    /// Whether this error came from the server side (5xx class).
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
