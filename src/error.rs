//! Error types for notif-hub

use thiserror::Error;

/// Errors that can occur in the event hub
#[derive(Debug, Error)]
pub enum HubError {
    /// Topic failed validation (wildcards, length, leading `$`/`.`, empty tokens)
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Subscription pattern failed validation
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Event payload exceeds the configured maximum
    #[error("Payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Stream backend connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream backend unavailable or failing
    #[error("Stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Append failure
    #[error("Failed to publish event to subject '{subject}': {reason}")]
    Publish { subject: String, reason: String },

    /// Consumer creation or management failure
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity not found (also returned for cross-tenant lookups)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid credentials
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed or out-of-order WebSocket frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session outbound queue overflowed
    #[error("Backpressure exceeded: outbound queue full")]
    BackpressureExceeded,

    /// Metadata database failure
    #[error("Store error: {0}")]
    Store(String),

    /// Outbound webhook delivery failure
    #[error("Webhook delivery failed: {0}")]
    Delivery(String),

    /// Schedule row in a state that forbids the operation
    #[error("Schedule '{id}' is {status}, expected pending")]
    ScheduleNotPending { id: String, status: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl From<sqlx::Error> for HubError {
    fn from(e: sqlx::Error) -> Self {
        HubError::Store(e.to_string())
    }
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
