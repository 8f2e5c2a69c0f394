//! Error types for the driftline client.

use thiserror::Error;

/// Errors that can occur in client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("message error: {0}")]
    Message(#[from] crate::message::MessageError),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("not connected to relay: {0}")]
    NotConnected(String),

    #[error("signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("event rejected by relay: {0}")]
    Rejected(String),

    #[error("publish failed on all relays")]
    PublishFailed {
        /// Per-relay failure reasons as (url, message) pairs
        failures: Vec<(String, String)>,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
