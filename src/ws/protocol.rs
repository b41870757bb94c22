//! WebSocket wire protocol
//!
//! Client frames are tagged by `action`, server frames by `type`, with the
//! field names subscribers see on the wire.

use crate::types::SubscribeOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Frames a client may send
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topics: Vec<String>,
        #[serde(default)]
        options: SubscribeOptions,
    },
    Ack {
        id: String,
    },
    Nack {
        id: String,
        /// Redelivery delay like "5m"; bounded server-side
        #[serde(default)]
        retry_in: Option<String>,
    },
}

/// Frames the server sends
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed,
    Event {
        id: String,
        topic: String,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
        attempt: u64,
        max_attempts: u64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes surfaced inside error frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ProtocolError,
    InvalidPattern,
    UnknownDelivery,
    BackpressureExceeded,
    Internal,
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }
}

/// Parse a client `retry_in` duration string ("1s", "5m", "1h")
pub fn parse_retry_in(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|e| format!("invalid retry_in '{raw}': {e}"))
}
