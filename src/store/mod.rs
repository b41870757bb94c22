//! Metadata store - the relational collaborator behind the hub
//!
//! The stream is the source of truth for undelivered events; the store holds
//! mutable metadata: api keys, webhook configs, webhook delivery audit rows,
//! schedules, and the per-event audit row. Backends implement the traits
//! here; an in-memory implementation backs the tests and a SQLite
//! implementation backs deployments.

use crate::error::Result;
use crate::tenant::Tenant;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod memory;
pub mod sql;

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Audit row written after each successful append (best-effort)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub topic: String,
    pub org: String,
    pub project: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// A registered webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub topics: Vec<String>,

    /// HMAC-SHA256 key; returned to the creator exactly once
    #[serde(skip_serializing)]
    pub secret: String,

    pub enabled: bool,
    pub org: String,
    pub project: String,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.org.clone(), self.project.clone())
    }
}

/// Outcome of one webhook delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Audit row for one webhook delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub webhook_id: String,
    pub event_id: String,
    pub topic: String,

    /// 1-based attempt number
    pub attempt: u32,

    pub status: DeliveryStatus,
    pub response_status: Option<u16>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a scheduled event
///
/// A row leaves `pending` exactly once; `running` is the claim state that
/// makes concurrent schedulers safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A future event waiting for its publish instant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub org: String,
    pub project: String,
    pub topic: String,
    pub data: serde_json::Value,
    pub scheduled_for: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    pub fn tenant(&self) -> Tenant {
        Tenant::new(self.org.clone(), self.project.clone())
    }
}

/// Resolves hashed API keys to tenants
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Look up a tenant by the SHA-256 hex hash of the presented key
    async fn resolve(&self, key_hash: &str) -> Result<Option<Tenant>>;
}

/// Per-event audit rows
#[async_trait]
pub trait EventRecordStore: Send + Sync {
    async fn record_event(&self, record: &EventRecord) -> Result<()>;
}

/// Webhook configuration CRUD
///
/// `revision` increments on every mutation so the worker's match cache can
/// invalidate without a callback channel.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn create_webhook(&self, webhook: &Webhook) -> Result<()>;

    async fn get_webhook(&self, tenant: &Tenant, id: &str) -> Result<Option<Webhook>>;

    async fn list_webhooks(&self, tenant: &Tenant) -> Result<Vec<Webhook>>;

    /// Enabled webhooks for a tenant, as consumed by the worker
    async fn enabled_webhooks(&self, tenant: &Tenant) -> Result<Vec<Webhook>>;

    async fn update_webhook(&self, webhook: &Webhook) -> Result<()>;

    /// Returns whether the webhook existed
    async fn delete_webhook(&self, tenant: &Tenant, id: &str) -> Result<bool>;

    async fn revision(&self) -> Result<u64>;
}

/// Webhook delivery audit rows
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    async fn list_deliveries(
        &self,
        tenant: &Tenant,
        webhook_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>>;
}

/// Schedule rows with compare-and-set claiming
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()>;

    async fn get_schedule(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>>;

    async fn list_schedules(
        &self,
        tenant: &Tenant,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<Schedule>>;

    /// `pending → cancelled`; returns the updated row, `None` if absent,
    /// an error if the row already left `pending`
    async fn cancel_schedule(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>>;

    /// Atomically claim due rows: `scheduled_for <= now AND status =
    /// 'pending'` transition to `running`. Concurrent claimers never
    /// receive the same row.
    async fn claim_due(&self, now: DateTime<Utc>, batch: usize) -> Result<Vec<Schedule>>;

    /// Claim one specific row regardless of its due time ("run now")
    async fn claim_one(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>>;

    /// `running → completed`
    async fn complete_schedule(&self, id: &str, executed_at: DateTime<Utc>) -> Result<()>;

    /// `running → failed`
    async fn fail_schedule(&self, id: &str, error: &str) -> Result<()>;
}

/// The full metadata store a hub instance runs against
pub trait MetadataStore:
    ApiKeyStore + EventRecordStore + WebhookStore + DeliveryStore + ScheduleStore
{
}

impl<T> MetadataStore for T where
    T: ApiKeyStore + EventRecordStore + WebhookStore + DeliveryStore + ScheduleStore
{
}
