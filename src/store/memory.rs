//! In-memory metadata store for tests and local development

use super::{
    ApiKeyStore, DeliveryRecord, DeliveryStore, EventRecord, EventRecordStore, Schedule,
    ScheduleStatus, ScheduleStore, Webhook, WebhookStore,
};
use crate::error::{HubError, Result};
use crate::tenant::Tenant;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// In-memory store backing the test suites
#[derive(Default)]
pub struct MemoryStore {
    api_keys: RwLock<HashMap<String, Tenant>>,
    events: RwLock<Vec<EventRecord>>,
    webhooks: RwLock<HashMap<String, Webhook>>,
    deliveries: RwLock<Vec<DeliveryRecord>>,
    schedules: RwLock<HashMap<String, Schedule>>,
    webhook_revision: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an API key by its hash
    pub async fn insert_api_key(&self, key_hash: impl Into<String>, tenant: Tenant) {
        self.api_keys.write().await.insert(key_hash.into(), tenant);
    }

    /// Recorded event audit rows (test introspection)
    pub async fn event_records(&self) -> Vec<EventRecord> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn resolve(&self, key_hash: &str) -> Result<Option<Tenant>> {
        Ok(self.api_keys.read().await.get(key_hash).cloned())
    }
}

#[async_trait]
impl EventRecordStore for MemoryStore {
    async fn record_event(&self, record: &EventRecord) -> Result<()> {
        self.events.write().await.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for MemoryStore {
    async fn create_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.webhooks
            .write()
            .await
            .insert(webhook.id.clone(), webhook.clone());
        self.webhook_revision.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_webhook(&self, tenant: &Tenant, id: &str) -> Result<Option<Webhook>> {
        Ok(self
            .webhooks
            .read()
            .await
            .get(id)
            .filter(|w| w.org == tenant.org && w.project == tenant.project)
            .cloned())
    }

    async fn list_webhooks(&self, tenant: &Tenant) -> Result<Vec<Webhook>> {
        let mut out: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .values()
            .filter(|w| w.org == tenant.org && w.project == tenant.project)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn enabled_webhooks(&self, tenant: &Tenant) -> Result<Vec<Webhook>> {
        Ok(self
            .list_webhooks(tenant)
            .await?
            .into_iter()
            .filter(|w| w.enabled)
            .collect())
    }

    async fn update_webhook(&self, webhook: &Webhook) -> Result<()> {
        let mut webhooks = self.webhooks.write().await;
        if !webhooks.contains_key(&webhook.id) {
            return Err(HubError::NotFound(format!("webhook {}", webhook.id)));
        }
        webhooks.insert(webhook.id.clone(), webhook.clone());
        self.webhook_revision.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_webhook(&self, tenant: &Tenant, id: &str) -> Result<bool> {
        let mut webhooks = self.webhooks.write().await;
        let owned = webhooks
            .get(id)
            .map(|w| w.org == tenant.org && w.project == tenant.project)
            .unwrap_or(false);
        if !owned {
            return Ok(false);
        }
        webhooks.remove(id);
        self.webhook_revision.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn revision(&self) -> Result<u64> {
        Ok(self.webhook_revision.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.deliveries.write().await.push(record.clone());
        Ok(())
    }

    async fn list_deliveries(
        &self,
        tenant: &Tenant,
        webhook_id: &str,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>> {
        // Tenant scoping rides on webhook ownership
        let owned = self.get_webhook(tenant, webhook_id).await?.is_some();
        if !owned {
            return Ok(Vec::new());
        }
        Ok(self
            .deliveries
            .read()
            .await
            .iter()
            .rev()
            .filter(|d| d.webhook_id == webhook_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.schedules
            .write()
            .await
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get_schedule(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>> {
        Ok(self
            .schedules
            .read()
            .await
            .get(id)
            .filter(|s| s.org == tenant.org && s.project == tenant.project)
            .cloned())
    }

    async fn list_schedules(
        &self,
        tenant: &Tenant,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<Schedule>> {
        let mut out: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.org == tenant.org && s.project == tenant.project)
            .filter(|s| status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        Ok(out)
    }

    async fn cancel_schedule(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>> {
        let mut schedules = self.schedules.write().await;
        let Some(row) = schedules
            .get_mut(id)
            .filter(|s| s.org == tenant.org && s.project == tenant.project)
        else {
            return Ok(None);
        };
        if row.status != ScheduleStatus::Pending {
            return Err(HubError::ScheduleNotPending {
                id: id.to_string(),
                status: row.status.as_str().to_string(),
            });
        }
        row.status = ScheduleStatus::Cancelled;
        Ok(Some(row.clone()))
    }

    async fn claim_due(&self, now: DateTime<Utc>, batch: usize) -> Result<Vec<Schedule>> {
        let mut schedules = self.schedules.write().await;
        let mut claimed = Vec::new();
        let mut due: Vec<&mut Schedule> = schedules
            .values_mut()
            .filter(|s| s.status == ScheduleStatus::Pending && s.scheduled_for <= now)
            .collect();
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for));
        for row in due.into_iter().take(batch) {
            row.status = ScheduleStatus::Running;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn claim_one(&self, tenant: &Tenant, id: &str) -> Result<Option<Schedule>> {
        let mut schedules = self.schedules.write().await;
        let Some(row) = schedules
            .get_mut(id)
            .filter(|s| s.org == tenant.org && s.project == tenant.project)
        else {
            return Ok(None);
        };
        if row.status != ScheduleStatus::Pending {
            return Err(HubError::ScheduleNotPending {
                id: id.to_string(),
                status: row.status.as_str().to_string(),
            });
        }
        row.status = ScheduleStatus::Running;
        Ok(Some(row.clone()))
    }

    async fn complete_schedule(&self, id: &str, executed_at: DateTime<Utc>) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let row = schedules
            .get_mut(id)
            .ok_or_else(|| HubError::NotFound(format!("schedule {id}")))?;
        row.status = ScheduleStatus::Completed;
        row.executed_at = Some(executed_at);
        Ok(())
    }

    async fn fail_schedule(&self, id: &str, error: &str) -> Result<()> {
        let mut schedules = self.schedules.write().await;
        let row = schedules
            .get_mut(id)
            .ok_or_else(|| HubError::NotFound(format!("schedule {id}")))?;
        row.status = ScheduleStatus::Failed;
        row.error = Some(error.to_string());
        Ok(())
    }
}
