//! # notif-hub
//!
//! Managed publish/subscribe event hub. Producers submit JSON events on
//! hierarchical topics over HTTP; subscribers receive them over WebSocket
//! with explicit acknowledgement, bounded retry, and DLQ escalation; a
//! webhook worker delivers matching events to registered endpoints with
//! HMAC-signed bodies; a scheduler injects future events into the same
//! pipeline. Everything is scoped to an `(org, project)` tenant.
//!
//! ## Guarantees
//!
//! - At-least-once delivery to every matching subscriber and webhook, with
//!   the DLQ recording anything that exhausts its attempt budget.
//! - At most `max_retries + 1` delivery attempts per event per sink.
//! - Group exclusivity: sessions sharing a group share one durable
//!   consumer, so each event reaches at most one member.
//! - Stream-order delivery within one `(topic, group)` while acks keep up.
//! - No operation crosses a tenant boundary; foreign ids read as not-found.
//!
//! ## Architecture
//!
//! - [`stream`] - gateway over a durable ordered log (NATS JetStream in
//!   production, an in-process backend for tests and local runs)
//! - [`subject`] - the `*`/`>` pattern language with specificity ranking
//! - [`publish`] - topic validation, envelope stamping, append
//! - [`consumer`] - durable lifecycle and group semantics
//! - [`ws`] - WebSocket sessions with ack tracking and redelivery
//! - [`webhook`] - signed outbound deliveries with retry and audit
//! - [`dlq`] - terminal-failure envelopes: list, replay, purge
//! - [`schedule`] - claim-and-execute future events
//! - [`store`] - metadata behind traits (SQLite or in-memory)
//! - [`api`] - axum routes and the session upgrade
//! - [`server`] - wiring and graceful shutdown

pub mod api;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod publish;
pub mod schedule;
pub mod server;
pub mod store;
pub mod stream;
pub mod subject;
pub mod tenant;
pub mod types;
pub mod webhook;
pub mod ws;

// Re-export the types most callers need
pub use config::HubConfig;
pub use consumer::ConsumerManager;
pub use dlq::DlqService;
pub use error::{HubError, Result};
pub use publish::{PublishReceipt, Publisher};
pub use schedule::{ScheduleAt, SchedulerService};
pub use server::Hub;
pub use stream::{MemoryGateway, NatsGateway, StreamGateway};
pub use subject::{best_match, validate_topic, Pattern};
pub use tenant::Tenant;
pub use types::{DlqEntry, DlqEnvelope, Event, StartFrom, SubscribeOptions};
