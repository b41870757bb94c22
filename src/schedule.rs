//! Scheduler - future events injected into the publish pipeline
//!
//! A single ticker claims due rows with a compare-and-set transition
//! (`pending → running`) so concurrent schedulers or retried ticks can
//! never execute the same row twice, then publishes and finalizes each row.

use crate::config::SchedulerConfig;
use crate::error::{HubError, Result};
use crate::publish::Publisher;
use crate::store::{Schedule, ScheduleStatus, ScheduleStore};
use crate::subject::validate_topic;
use crate::tenant::Tenant;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// When a schedule should fire
#[derive(Debug, Clone)]
pub enum ScheduleAt {
    /// Explicit RFC3339 instant
    At(DateTime<Utc>),
    /// Relative offset from now ("30m")
    In(Duration),
}

impl ScheduleAt {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Self::At(t) => Ok(*t),
            Self::In(d) => {
                let offset = chrono::Duration::from_std(*d)
                    .map_err(|_| HubError::Config(format!("offset {d:?} out of range")))?;
                Ok(now + offset)
            }
        }
    }
}

/// Creates, cancels, and executes scheduled events
pub struct SchedulerService {
    store: Arc<dyn ScheduleStore>,
    publisher: Arc<Publisher>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        publisher: Arc<Publisher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Create a pending schedule row
    pub async fn create(
        &self,
        tenant: &Tenant,
        topic: &str,
        data: serde_json::Value,
        when: ScheduleAt,
    ) -> Result<Schedule> {
        validate_topic(topic)?;
        let now = Utc::now();
        let schedule = Schedule {
            id: format!("sch-{}", uuid::Uuid::new_v4()),
            org: tenant.org.clone(),
            project: tenant.project.clone(),
            topic: topic.to_string(),
            data,
            scheduled_for: when.resolve(now)?,
            status: ScheduleStatus::Pending,
            executed_at: None,
            error: None,
            created_at: now,
        };
        self.store.create_schedule(&schedule).await?;

        tracing::info!(
            schedule = %schedule.id,
            topic = topic,
            tenant = %tenant,
            scheduled_for = %schedule.scheduled_for,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub async fn get(&self, tenant: &Tenant, id: &str) -> Result<Schedule> {
        self.store
            .get_schedule(tenant, id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("schedule {id}")))
    }

    pub async fn list(
        &self,
        tenant: &Tenant,
        status: Option<ScheduleStatus>,
    ) -> Result<Vec<Schedule>> {
        self.store.list_schedules(tenant, status).await
    }

    /// `pending → cancelled`; cancelled rows never emit
    pub async fn cancel(&self, tenant: &Tenant, id: &str) -> Result<Schedule> {
        self.store
            .cancel_schedule(tenant, id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("schedule {id}")))
    }

    /// Claim and execute one row immediately, regardless of its due time
    pub async fn run_now(&self, tenant: &Tenant, id: &str) -> Result<Schedule> {
        let claimed = self
            .store
            .claim_one(tenant, id)
            .await?
            .ok_or_else(|| HubError::NotFound(format!("schedule {id}")))?;
        self.execute(&claimed).await;
        self.get(tenant, id).await
    }

    /// Publish a claimed row and finalize its status
    async fn execute(&self, schedule: &Schedule) {
        let tenant = schedule.tenant();
        match self
            .publisher
            .publish(&tenant, &schedule.topic, schedule.data.clone())
            .await
        {
            Ok(receipt) => {
                let executed_at = Utc::now();
                if let Err(e) = self.store.complete_schedule(&schedule.id, executed_at).await {
                    tracing::error!(schedule = %schedule.id, error = %e, "Failed to mark schedule completed");
                    return;
                }
                tracing::info!(
                    schedule = %schedule.id,
                    event_id = %receipt.id,
                    topic = %schedule.topic,
                    "Schedule executed"
                );
            }
            Err(e) => {
                let error = e.to_string();
                if let Err(e) = self.store.fail_schedule(&schedule.id, &error).await {
                    tracing::error!(schedule = %schedule.id, error = %e, "Failed to mark schedule failed");
                    return;
                }
                tracing::warn!(schedule = %schedule.id, error = %error, "Schedule execution failed");
            }
        }
    }

    /// Ticker loop: claim due rows each poll and execute them
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        tracing::info!(
            interval_secs = self.config.poll_interval_secs,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let claimed = match self.store.claim_due(Utc::now(), self.config.batch).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(error = %e, "Schedule claim failed");
                    continue;
                }
            };
            for schedule in &claimed {
                self.execute(schedule).await;
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
