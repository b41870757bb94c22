//! SQLite metadata store
//!
//! Uses runtime-checked sqlx queries so the schema bootstraps on startup
//! without a migration toolchain. The stream remains the source of truth
//! for undelivered events; everything here is mutable metadata and audit.

use super::{
    ApiKeyStore, DeliveryRecord, DeliveryStatus, DeliveryStore, EventRecord, EventRecordStore,
    Schedule, ScheduleStatus, ScheduleStore, Webhook, WebhookStore,
};
use crate::error::{HubError, Result};
use crate::tenant::Tenant;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    key_hash   TEXT PRIMARY KEY,
    org        TEXT NOT NULL,
    project    TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS event_records (
    id         TEXT NOT NULL,
    topic      TEXT NOT NULL,
    org        TEXT NOT NULL,
    project    TEXT NOT NULL,
    sequence   INTEGER NOT NULL,
    timestamp  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_records_tenant ON event_records (org, project, topic);
CREATE TABLE IF NOT EXISTS webhooks (
    id         TEXT PRIMARY KEY,
    url        TEXT NOT NULL,
    topics     TEXT NOT NULL,
    secret     TEXT NOT NULL,
    enabled    INTEGER NOT NULL,
    org        TEXT NOT NULL,
    project    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_webhooks_tenant ON webhooks (org, project);
CREATE TABLE IF NOT EXISTS webhook_deliveries (
    webhook_id      TEXT NOT NULL,
    event_id        TEXT NOT NULL,
    topic           TEXT NOT NULL,
    attempt         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    response_status INTEGER,
    error           TEXT,
    created_at      TEXT NOT NULL,
    delivered_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_deliveries_webhook ON webhook_deliveries (webhook_id, created_at);
CREATE TABLE IF NOT EXISTS schedules (
    id            TEXT PRIMARY KEY,
    org           TEXT NOT NULL,
    project       TEXT NOT NULL,
    topic         TEXT NOT NULL,
    data          TEXT NOT NULL,
    scheduled_for TEXT NOT NULL,
    status        TEXT NOT NULL,
    executed_at   TEXT,
    error         TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_schedules_due ON schedules (status, scheduled_for);
CREATE TABLE IF NOT EXISTS webhook_revision (
    id  INTEGER PRIMARY KEY CHECK (id = 1),
    rev INTEGER NOT NULL
);
INSERT OR IGNORE INTO webhook_revision (id, rev) VALUES (1, 0);
"#;

/// SQLite-backed metadata store
pub struct SqlStore {
    pool: SqlitePool,
}

impl SqlStore {
    /// Connect and bootstrap the schema
    pub async fn connect(url: &str) -> Result<Self> {
        // A pooled in-memory database is one database per connection;
        // clamp to a single connection so the schema is shared
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }
        tracing::info!(url = url, "Metadata store ready");
        Ok(Self { pool })
    }

    /// Register an API key by its hash
    pub async fn insert_api_key(&self, key_hash: &str, tenant: &Tenant) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO api_keys (key_hash, org, project) VALUES (?1, ?2, ?3)")
            .bind(key_hash)
            .bind(&tenant.org)
            .bind(&tenant.project)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn bump_revision(&self) -> Result<()> {
        sqlx::query("UPDATE webhook_revision SET rev = rev + 1 WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn webhook_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Webhook> {
    let topics: String = row.get("topics");
    Ok(Webhook {
        id: row.get("id"),
        url: row.get("url"),
        topics: serde_json::from_str(&topics)?,
        secret: row.get("secret"),
        enabled: row.get::<i64, _>("enabled") != 0,
        org: row.get("org"),
        project: row.get("project"),
        created_at: row.get("created_at"),
    })
}

fn schedule_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Schedule> {
    let data: String = row.get("data");
    let status: String = row.get("status");
    Ok(Schedule {
        id: row.get("id"),
        org: row.get("org"),
        project: row.get("project"),
        topic: row.get("topic"),
        data: serde_json::from_str(&data)?,
        scheduled_for: row.get("scheduled_for"),
        status: ScheduleStatus::parse(&status)
            .ok_or_else(|| HubError::Store(format!("unknown schedule status '{status}'")))?,
        executed_at: row.get("executed_at"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

fn delivery_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<DeliveryRecord> {
    let status: String = row.get("status");
    let status = match status.as_str() {
        "pending" => DeliveryStatus::Pending,
        "success" => DeliveryStatus::Success,
        "failed" => DeliveryStatus::Failed,
        other => return Err(HubError::Store(format!("unknown delivery status '{other}'"))),
    };
    Ok(DeliveryRecord {
        webhook_id: row.get("webhook_id"),
        event_id: row.get("event_id"),
        topic: row.get("topic"),
        attempt: row.get::<i64, _>("attempt") as u32,
        status,
        response_status: row
            .get::<Option<i64>, _>("response_status")
            .map(|s| s as u16),
        error: row.get("error"),
        created_at: row.get("created_at"),
        delivered_at: row.get("delivered_at"),
    })
}

#[async_trait]
impl ApiKeyStore for SqlStore {
    async fn resolve(&self, key_hash: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT org, project FROM api_keys WHERE key_hash = ?1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Tenant::new(r.get::<String, _>("org"), r.get::<String, _>("project"))))
    }
}

#[async_trait]
impl EventRecordStore for SqlStore {
    async fn record_event(&self, record: &EventRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO event_records (id, topic, org, project, sequence, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&record.id)
        .bind(&record.topic)
        .bind(&record.org)
        .bind(&record.project)
        .bind(record.sequence as i64)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for SqlStore {
    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhooks (id, url, topics, secret, enabled, org, project, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&webhook.id)
        .bind(&webhook.url)
        .bind(serde_json::to_string(&webhook.topics)?)
        .bind(&webhook.secret)
        .bind(webhook.enabled as i64)
        .bind(&webhook.org)
        .bind(&webhook.project)
        .bind(webhook.created_at)
        .execute(&self.pool)
        .await?;
        self.bump_revision().await
    }

    async fn get_webhook(&self, tenant: &Tenant, id: &str) -> Result<Option<Webhook>> {
        let row =
            sqlx::query("SELECT * FROM webhooks WHERE id = ?1 AND org = ?2 AND project = ?3")
                .bind(id)
                .bind(&tenant.org)
                .bind(&tenant.project)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| webhook_from_row(&r)).transpose()
    }

    async fn list_webhooks(&self, tenant: &Tenant) -> Result<Vec<Webhook>> {
        let rows = sqlx::query(
            "SELECT * FROM webhooks WHERE org = ?1 AND project = ?2 ORDER BY created_at",
        )
        .bind(&tenant.org)
        .bind(&tenant.project)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn enabled_webhooks(&self, tenant: &Tenant) -> Result<Vec<Webhook>> {
        let rows = sqlx::query(
            "SELECT * FROM webhooks WHERE org = ?1 AND project = ?2 AND enabled = 1 \
             ORDER BY created_at",
        )
        .bind(&tenant.org)
        .bind(&tenant.project)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<()> {
        let result = sqlx::query(
            "UPDATE webhooks SET url = ?2, topics = ?3, enabled = ?4 WHERE id = ?1",
        )
        .bind(&webhook.id)
        .bind(&webhook.url)
        .bind(serde_json::to_string(&webhook.topics)?)
        .bind(webhook.enabled as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::NotFound(format!("webhook {}", webhook.id)));
        }
        self.bump_revision().await
    }

    async fn delete_webhook(&self, tenant: &Tenant, id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM webhooks WHERE id = ?1 AND org = ?2 AND project = ?3")
                .bind(id)
                .bind(&tenant.org)
                .bind(&tenant.project)
                .execute(&self.pool)
                .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.bump_revision().await?;
        }
        Ok(deleted)
    }

    async fn revision(&self) -> Result<u64> {
        let row = sqlx::query("SELECT rev FROM webhook_revision WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("rev") as u64)
    }
}

#[async_trait]
impl DeliveryStore for SqlStore {
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO webhook_deliveries \
             (webhook_id, event_id, topic, attempt, status, response_status, error, created_at, delivered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&record.webhook_id)
        .bind(&record.event_id)
        .bind(&record.topic)
        .bind(record.attempt as i64)
        .bind(record.status.as_str())
        .bind(record.response_status.map(|s| s as i64))
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.delivered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_deliveries(
        &self,
        tenant: &Tenant,
        webhook_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        // Cross-tenant webhook ids read as empty, never as an error
        if self.get_webhook(tenant, webhook_id).await?.is_none() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT * FROM webhook_deliveries WHERE webhook_id = ?1 \
             ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(webhook_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}

#[async_trait]
impl ScheduleStore for SqlStore {
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedules \
             (id, org, project, topic, data, scheduled_for, status, executed_at, error, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&schedule.id)
        .bind(&schedule.org)
        .bind(&schedule.project)
        .bind(&schedule.topic)
        .bind(serde_json::to_string(&schedule.data)?)
        .bind(schedule.scheduled_for)
        .bind(schedule.status.as_str())
        .bind(schedule.executed_at)
        .bind(&schedule.error)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>> {
        let row =
            sqlx::query("SELECT * FROM schedules WHERE id = ?1 AND org = ?2 AND project = ?3")
                .bind(id)
                .bind(&tenant.org)
                .bind(&tenant.project)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|r| schedule_from_row(&r)).transpose()
    }

    async fn list_schedules(
        &self,
        tenant: &Tenant,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<Schedule>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM schedules WHERE org = ?1 AND project = ?2 AND status = ?3 \
                     ORDER BY scheduled_for",
                )
                .bind(&tenant.org)
                .bind(&tenant.project)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM schedules WHERE org = ?1 AND project = ?2 \
                     ORDER BY scheduled_for",
                )
                .bind(&tenant.org)
                .bind(&tenant.project)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(schedule_from_row).collect()
    }

    async fn cancel_schedule(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            "UPDATE schedules SET status = 'cancelled' \
             WHERE id = ?1 AND org = ?2 AND project = ?3 AND status = 'pending' \
             RETURNING *",
        )
        .bind(id)
        .bind(&tenant.org)
        .bind(&tenant.project)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(Some(schedule_from_row(&row)?));
        }
        // Distinguish absent from already-transitioned
        match self.get_schedule(tenant, id).await? {
            None => Ok(None),
            Some(existing) => Err(HubError::ScheduleNotPending {
                id: id.to_string(),
                status: existing.status.as_str().to_string(),
            }),
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>, batch: usize) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "UPDATE schedules SET status = 'running' WHERE id IN ( \
               SELECT id FROM schedules WHERE status = 'pending' AND scheduled_for <= ?1 \
               ORDER BY scheduled_for LIMIT ?2 \
             ) RETURNING *",
        )
        .bind(now)
        .bind(batch as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn claim_one(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query(
            "UPDATE schedules SET status = 'running' \
             WHERE id = ?1 AND org = ?2 AND project = ?3 AND status = 'pending' \
             RETURNING *",
        )
        .bind(id)
        .bind(&tenant.org)
        .bind(&tenant.project)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = row {
            return Ok(Some(schedule_from_row(&row)?));
        }
        match self.get_schedule(tenant, id).await? {
            None => Ok(None),
            Some(existing) => Err(HubError::ScheduleNotPending {
                id: id.to_string(),
                status: existing.status.as_str().to_string(),
            }),
        }
    }

    async fn complete_schedule(&self, id: &str, executed_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE schedules SET status = 'completed', executed_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(executed_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_schedule(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE schedules SET status = 'failed', error = ?2 WHERE id = ?1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqlStore {
        SqlStore::connect("sqlite::memory:").await.unwrap()
    }

    fn tenant() -> Tenant {
        Tenant::new("acme", "prod")
    }

    #[tokio::test]
    async fn test_schema_bootstrap_and_api_keys() {
        let store = store().await;
        store.insert_api_key("hash-1", &tenant()).await.unwrap();
        assert_eq!(store.resolve("hash-1").await.unwrap(), Some(tenant()));
        assert_eq!(store.resolve("hash-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_webhook_roundtrip() {
        let store = store().await;
        let webhook = Webhook {
            id: "wh-1".to_string(),
            url: "https://example.com/hook".to_string(),
            topics: vec!["orders.*".to_string(), "billing.>".to_string()],
            secret: "whsec_x".to_string(),
            enabled: true,
            org: "acme".to_string(),
            project: "prod".to_string(),
            created_at: Utc::now(),
        };
        store.create_webhook(&webhook).await.unwrap();

        let loaded = store.get_webhook(&tenant(), "wh-1").await.unwrap().unwrap();
        assert_eq!(loaded.topics, webhook.topics);
        assert_eq!(loaded.secret, "whsec_x");

        let other = Tenant::new("rival", "prod");
        assert!(store.get_webhook(&other, "wh-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_due_cas() {
        let store = store().await;
        let schedule = Schedule {
            id: "s-1".to_string(),
            org: "acme".to_string(),
            project: "prod".to_string(),
            topic: "orders.new".to_string(),
            data: serde_json::json!({"n": 1}),
            scheduled_for: Utc::now() - chrono::Duration::seconds(1),
            status: ScheduleStatus::Pending,
            executed_at: None,
            error: None,
            created_at: Utc::now(),
        };
        store.create_schedule(&schedule).await.unwrap();

        let claimed = store.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, ScheduleStatus::Running);
        assert!(store.claim_due(Utc::now(), 10).await.unwrap().is_empty());

        store.complete_schedule("s-1", Utc::now()).await.unwrap();
        let row = store.get_schedule(&tenant(), "s-1").await.unwrap().unwrap();
        assert_eq!(row.status, ScheduleStatus::Completed);
        assert!(row.executed_at.is_some());
    }
}
