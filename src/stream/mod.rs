//! Stream gateway - the abstraction over a durable ordered log
//!
//! Backends implement `StreamGateway` to provide append, range scan, direct
//! get/delete, and pull consumers with ack/nack bookkeeping across the
//! primary `EVENTS` stream and its sibling `DLQ` stream.

use crate::error::Result;
use crate::types::StartFrom;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

pub mod memory;
pub mod nats;

pub use memory::MemoryGateway;
pub use nats::NatsGateway;

/// Which durable stream an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Primary stream, subjects `events.>`
    Events,
    /// Dead letter stream, subjects `dlq.>`, longer retention
    Dlq,
}

/// Attributes of a pull consumer
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    /// Union of subject filters (already tenant-scoped by the caller)
    pub filter_subjects: Vec<String>,

    /// How long the backend waits for an ack before redelivery
    pub ack_wait: Duration,

    /// Delivery attempts before the backend stops redelivering (0 = unlimited)
    pub max_deliver: i64,

    /// Where the consumer starts reading
    pub deliver_from: StartFrom,

    /// In-flight unacked message cap (backpressure)
    pub max_ack_pending: i64,
}

impl Default for ConsumerSpec {
    fn default() -> Self {
        Self {
            filter_subjects: Vec::new(),
            ack_wait: Duration::from_secs(300),
            max_deliver: 0,
            deliver_from: StartFrom::Latest,
            max_ack_pending: 256,
        }
    }
}

/// A message stored on a stream, as returned by direct reads
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub sequence: u64,
    pub subject: String,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumers: usize,
}

/// Core trait for durable log backends
#[async_trait]
pub trait StreamGateway: Send + Sync {
    /// Append a payload, returning the stream-assigned sequence number
    async fn append(&self, stream: StreamKind, subject: &str, payload: Bytes) -> Result<u64>;

    /// Create or attach to a durable pull consumer
    ///
    /// Multiple handles on the same durable share its cursor and pending
    /// set: each message is delivered to at most one handle.
    async fn durable(
        &self,
        stream: StreamKind,
        name: &str,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn StreamConsumer>>;

    /// Create an ephemeral consumer, cleaned up when the handle drops
    async fn ephemeral(
        &self,
        stream: StreamKind,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn StreamConsumer>>;

    /// Delete a durable consumer and its redelivery bookkeeping
    async fn delete_consumer(&self, stream: StreamKind, name: &str) -> Result<()>;

    /// Fetch one stored message by sequence
    async fn get(&self, stream: StreamKind, sequence: u64) -> Result<Option<StoredEntry>>;

    /// Delete one stored message; returns whether it existed
    async fn delete(&self, stream: StreamKind, sequence: u64) -> Result<bool>;

    /// Read up to `limit` stored messages matching a subject filter,
    /// oldest first, without consuming them
    async fn scan(
        &self,
        stream: StreamKind,
        filter_subject: &str,
        limit: usize,
    ) -> Result<Vec<StoredEntry>>;

    /// Stream state for health/introspection
    async fn info(&self, stream: StreamKind) -> Result<StreamStats>;

    /// Backend name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check - true if the backend is connected and operational
    async fn health(&self) -> Result<bool> {
        self.info(StreamKind::Events).await.map(|_| true)
    }
}

/// Pull handle for receiving messages from a consumer
#[async_trait]
pub trait StreamConsumer: Send + Sync {
    /// Receive the next message; `None` means the consumer ended
    async fn next(&mut self) -> Result<Option<PendingMessage>>;
}

/// Ack/nack callbacks for one in-flight delivery
#[async_trait]
pub trait MessageAck: Send + Sync {
    /// Confirm processing; the consumer advances
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Request redelivery, optionally after a delay
    async fn nack(self: Box<Self>, delay: Option<Duration>) -> Result<()>;
}

/// A delivered message pending acknowledgement
pub struct PendingMessage {
    pub subject: String,
    pub payload: Bytes,

    /// Stream sequence of the underlying message
    pub sequence: u64,

    /// Backend delivery count, 1 on first delivery
    pub delivered: u64,

    acker: Box<dyn MessageAck>,
}

impl PendingMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Bytes,
        sequence: u64,
        delivered: u64,
        acker: Box<dyn MessageAck>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            sequence,
            delivered,
            acker,
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negative-acknowledge, optionally delaying redelivery
    pub async fn nack(self, delay: Option<Duration>) -> Result<()> {
        self.acker.nack(delay).await
    }

    /// Detach the ack handle for deferred acknowledgement
    pub fn into_acker(self) -> Box<dyn MessageAck> {
        self.acker
    }
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("delivered", &self.delivered)
            .finish_non_exhaustive()
    }
}
