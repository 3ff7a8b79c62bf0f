//! Error types for the session engine

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our SessionError
pub type Result<T> = std::result::Result<T, SessionError>;

/// Main error type for session operations
#[derive(Error, Debug)]
pub enum SessionError {
    /// A frame was sent while the connection was not Ready
    #[error("Not connected to the venue")]
    NotConnected,

    /// Pending work was aborted because the connection dropped
    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    /// No correlated response arrived within the request budget
    #[error("Request {req_id} timed out after {timeout:?}")]
    RequestTimeout { req_id: u64, timeout: Duration },

    /// The venue rejected the stored credential token
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Error payload echoed by the venue, passed through unchanged
    #[error("Venue error [{code}]: {message}")]
    Venue { code: String, message: String },

    /// The recovery controller refused to size a stake beyond the ceiling
    #[error("Stake limit exceeded: next stake {next_stake} is above the maximum {max_stake}")]
    StakeLimitExceeded {
        next_stake: Decimal,
        max_stake: Decimal,
    },

    /// WebSocket connection errors
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    /// WebSocket send/receive errors
    #[error("WebSocket communication error: {0}")]
    WebSocketCommunication(String),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Response did not have the expected shape
    #[error("Invalid venue response: {0}")]
    InvalidResponse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Channel send errors
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Errors that must stop the strategy loop instead of being retried
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::AuthorizationFailed(_) | SessionError::StakeLimitExceeded { .. }
        )
    }

    /// Errors caused by the connection rather than by the request itself
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::NotConnected
                | SessionError::ConnectionLost
                | SessionError::RequestTimeout { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::WebSocketCommunication(err.to_string())
    }
}
