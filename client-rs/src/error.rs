//! Error types for the chatbus client

use crate::messages::FailureReason;
use thiserror::Error;

/// Errors that can occur when using the chatbus client
#[derive(Error, Debug)]
pub enum ChatbusError {
    /// Connection to the bridge failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not currently connected to the bridge
    #[error("Not connected")]
    NotConnected,

    /// No acknowledgement within the operation timeout
    #[error("Operation timed out")]
    Timeout,

    /// The channel is outside the bridge allowlist
    #[error("Permission denied on '{channel}': {message}")]
    Denied { channel: String, message: String },

    /// The bridge gave up on a request
    #[error("Request failed: {0:?}")]
    RequestFailed(FailureReason),

    /// Failed to serialize/deserialize a frame
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The client has been shut down
    #[error("Client shut down")]
    Shutdown,
}

/// Result type for chatbus client operations
pub type Result<T> = std::result::Result<T, ChatbusError>;
