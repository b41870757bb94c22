//! Core event types for the hub
//!
//! Wire frames serialize with the exact field names clients see, so these
//! types use default snake_case serde.

use crate::tenant::Tenant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The immutable record stored on the primary stream
///
/// Events are appended to subjects of the form
/// `events.<org>.<project>.<topic>` and carry a monotonic sequence number
/// assigned by the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier (`evt-<uuid>`), preserved across DLQ replay
    pub id: String,

    /// Dotted topic, no wildcards
    pub topic: String,

    /// Opaque JSON payload
    pub data: serde_json::Value,

    /// Wall clock at publish
    pub timestamp: DateTime<Utc>,

    pub org: String,
    pub project: String,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp
    pub fn new(topic: impl Into<String>, data: serde_json::Value, tenant: &Tenant) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            topic: topic.into(),
            data,
            timestamp: Utc::now(),
            org: tenant.org.clone(),
            project: tenant.project.clone(),
        }
    }

    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.org.clone(), self.project.clone())
    }
}

/// Envelope stored on the DLQ stream after a sink exhausts its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    /// The original event, unchanged
    pub event: Event,

    pub original_topic: String,

    pub failed_at: DateTime<Utc>,

    /// Delivery attempts consumed before escalation
    pub attempts: u64,

    pub last_error: String,

    /// Consumer group that exhausted the event; empty for broadcast,
    /// `webhook:<id>` for webhook endpoints
    #[serde(default)]
    pub consumer_group: String,
}

impl DlqEnvelope {
    pub fn new(
        event: Event,
        attempts: u64,
        last_error: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        let original_topic = event.topic.clone();
        Self {
            event,
            original_topic,
            failed_at: Utc::now(),
            attempts,
            last_error: last_error.into(),
            consumer_group: consumer_group.into(),
        }
    }
}

/// A DLQ entry as read back from the stream
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    /// DLQ stream sequence, used to replay or delete the entry
    pub sequence: u64,

    #[serde(flatten)]
    pub envelope: DlqEnvelope,
}

/// Where a new subscription starts reading from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StartFrom {
    /// Only events published after the subscription
    #[default]
    Latest,
    /// Everything retained on the stream
    Beginning,
    /// Events at or after an RFC3339 instant
    Time(DateTime<Utc>),
}

impl StartFrom {
    /// Parse the wire form: `"latest"`, `"beginning"`, or an RFC3339 timestamp
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "latest" => Ok(Self::Latest),
            "beginning" => Ok(Self::Beginning),
            other => DateTime::parse_from_rfc3339(other)
                .map(|t| Self::Time(t.with_timezone(&Utc)))
                .map_err(|_| format!("invalid 'from' position: {other}")),
        }
    }
}

impl Serialize for StartFrom {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Latest => serializer.serialize_str("latest"),
            Self::Beginning => serializer.serialize_str("beginning"),
            Self::Time(t) => serializer.serialize_str(&t.to_rfc3339()),
        }
    }
}

impl<'de> Deserialize<'de> for StartFrom {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Options carried by a subscribe frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Ack each event immediately after a successful socket write
    #[serde(default)]
    pub auto_ack: bool,

    #[serde(default)]
    pub from: StartFrom,

    /// Consumer group; empty means broadcast
    #[serde(default)]
    pub group: String,

    /// Redeliveries before DLQ escalation (total attempts = max_retries + 1)
    #[serde(default = "default_max_retries")]
    pub max_retries: u64,

    /// Seconds to wait for an ack before an implicit nack
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout: u64,
}

fn default_max_retries() -> u64 {
    5
}

fn default_ack_timeout_secs() -> u64 {
    300
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            auto_ack: false,
            from: StartFrom::Latest,
            group: String::new(),
            max_retries: default_max_retries(),
            ack_timeout: default_ack_timeout_secs(),
        }
    }
}

impl SubscribeOptions {
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    /// Maximum delivery attempts per event for this subscription
    pub fn max_attempts(&self) -> u64 {
        self.max_retries + 1
    }

    pub fn is_broadcast(&self) -> bool {
        self.group.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> Tenant {
        Tenant::new("acme", "prod")
    }

    #[test]
    fn test_event_creation() {
        let event = Event::new("orders.new", serde_json::json!({"id": 1}), &tenant());
        assert!(event.id.starts_with("evt-"));
        assert_eq!(event.topic, "orders.new");
        assert_eq!(event.org, "acme");
        assert_eq!(event.project, "prod");
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = Event::new("orders.new", serde_json::json!({"id": 1}), &tenant());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"topic\":\"orders.new\""));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, event.id);
        assert_eq!(parsed.data, event.data);
        assert_eq!(parsed.timestamp, event.timestamp);
    }

    #[test]
    fn test_dlq_envelope_captures_topic() {
        let event = Event::new("orders.new", serde_json::json!({}), &tenant());
        let id = event.id.clone();
        let env = DlqEnvelope::new(event, 4, "connection reset", "worker");
        assert_eq!(env.original_topic, "orders.new");
        assert_eq!(env.attempts, 4);
        assert_eq!(env.consumer_group, "worker");
        assert_eq!(env.event.id, id);
    }

    #[test]
    fn test_start_from_parse() {
        assert_eq!(StartFrom::parse("latest").unwrap(), StartFrom::Latest);
        assert_eq!(StartFrom::parse("beginning").unwrap(), StartFrom::Beginning);
        assert!(matches!(
            StartFrom::parse("2026-01-01T00:00:00Z").unwrap(),
            StartFrom::Time(_)
        ));
        assert!(StartFrom::parse("yesterday").is_err());
    }

    #[test]
    fn test_start_from_wire_roundtrip() {
        let from: StartFrom = serde_json::from_str("\"beginning\"").unwrap();
        assert_eq!(from, StartFrom::Beginning);
        assert_eq!(serde_json::to_string(&from).unwrap(), "\"beginning\"");
    }

    #[test]
    fn test_subscribe_options_defaults() {
        let opts: SubscribeOptions = serde_json::from_str("{}").unwrap();
        assert!(!opts.auto_ack);
        assert_eq!(opts.from, StartFrom::Latest);
        assert!(opts.is_broadcast());
        assert_eq!(opts.max_retries, 5);
        assert_eq!(opts.max_attempts(), 6);
        assert_eq!(opts.ack_wait(), Duration::from_secs(300));
    }

    #[test]
    fn test_subscribe_options_group() {
        let opts: SubscribeOptions =
            serde_json::from_str(r#"{"group":"worker","max_retries":3}"#).unwrap();
        assert!(!opts.is_broadcast());
        assert_eq!(opts.max_attempts(), 4);
    }
}
