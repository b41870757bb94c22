//! Hub configuration
//!
//! All sections carry serde defaults so a partial config file (or none at
//! all) yields a runnable local hub.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the hub server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP/WebSocket server
    pub bind: String,

    /// Seconds existing sockets may drain after shutdown begins
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            shutdown_grace_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,

    /// Optional auth token
    pub token: Option<String>,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Primary stream name (subjects `events.>`)
    pub events_name: String,

    /// Time-based retention for the primary stream
    pub events_max_age_secs: u64,

    /// Size cap for the primary stream (-1 = unlimited)
    pub events_max_bytes: i64,

    /// Sibling DLQ stream name (subjects `dlq.>`), longer retention
    pub dlq_name: String,

    pub dlq_max_age_secs: u64,

    /// Maximum serialized event payload in bytes
    pub max_payload: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            events_name: "EVENTS".to_string(),
            events_max_age_secs: 24 * 60 * 60,
            events_max_bytes: 1024 * 1024 * 1024,
            dlq_name: "DLQ".to_string(),
            dlq_max_age_secs: 7 * 24 * 60 * 60,
            max_payload: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Pending-delivery window per session
    pub prefetch: usize,

    /// Outbound frame queue depth; overflow closes the socket
    pub outbound_queue: usize,

    /// Server ping period; a missed pong for a full period marks the socket dead
    pub heartbeat_secs: u64,

    /// Janitor scan period for ack-timeout detection
    pub janitor_interval_secs: u64,

    /// Bounds applied to client-requested `retry_in` delays
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefetch: 64,
            outbound_queue: 256,
            heartbeat_secs: 30,
            janitor_interval_secs: 1,
            min_backoff_secs: 1,
            max_backoff_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Total attempts per delivery before DLQ escalation
    pub max_attempts: u32,

    /// Exponential backoff base and cap (full jitter applied)
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Per-attempt HTTP timeout
    pub attempt_timeout_secs: u64,

    /// TTL of the per-tenant config match cache
    pub config_cache_ttl_secs: u64,

    /// Global bounded delivery job queue
    pub job_queue: usize,

    /// Concurrent deliveries per endpoint
    pub per_endpoint_concurrency: usize,

    /// Ack wait on the worker's durable; must exceed the worst retry schedule
    pub ack_wait_secs: u64,

    /// In-flight events pulled from the worker's durable
    pub max_ack_pending: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            attempt_timeout_secs: 10,
            config_cache_ttl_secs: 30,
            job_queue: 1_024,
            per_endpoint_concurrency: 4,
            ack_wait_secs: 10 * 60,
            max_ack_pending: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,

    /// Rows claimed per tick
    pub batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            batch: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection string for the metadata store
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
        }
    }
}

/// Static API keys for local development; production deployments resolve
/// keys through the metadata store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub static_keys: Vec<StaticKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticKey {
    pub key: String,
    pub org: String,
    pub project: String,
}

impl SessionConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs.max(1))
    }

    /// Clamp a client-requested redelivery delay into the configured bounds
    pub fn clamp_backoff(&self, requested: Duration) -> Duration {
        let min = Duration::from_secs(self.min_backoff_secs);
        let max = Duration::from_secs(self.max_backoff_secs).max(min);
        requested.clamp(min, max)
    }
}
