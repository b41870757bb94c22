//! Publisher - validates, stamps, and appends events
//!
//! The stream append is the source of truth: once it succeeds the producer
//! gets its receipt. The metadata row behind it is best-effort audit and
//! never rolls back the append.

use crate::error::{HubError, Result};
use crate::store::{EventRecord, EventRecordStore};
use crate::stream::{StreamGateway, StreamKind};
use crate::subject::validate_topic;
use crate::tenant::Tenant;
use crate::types::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// What the producer gets back from an accepted emit
#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub id: String,
    pub topic: String,
    pub timestamp: DateTime<Utc>,
}

/// Appends validated events to the primary stream
pub struct Publisher {
    gateway: Arc<dyn StreamGateway>,
    records: Arc<dyn EventRecordStore>,
    max_payload: usize,
}

impl Publisher {
    pub fn new(
        gateway: Arc<dyn StreamGateway>,
        records: Arc<dyn EventRecordStore>,
        max_payload: usize,
    ) -> Self {
        Self {
            gateway,
            records,
            max_payload,
        }
    }

    /// Validate, stamp, and append a new event
    pub async fn publish(
        &self,
        tenant: &Tenant,
        topic: &str,
        data: serde_json::Value,
    ) -> Result<PublishReceipt> {
        validate_topic(topic)?;

        let size = serde_json::to_vec(&data)?.len();
        if size > self.max_payload {
            return Err(HubError::PayloadTooLarge {
                size,
                max: self.max_payload,
            });
        }

        let event = Event::new(topic, data, tenant);
        let sequence = self.append(&event).await?;

        tracing::info!(
            event_id = %event.id,
            topic = topic,
            tenant = %tenant,
            sequence = sequence,
            "Event published"
        );

        Ok(PublishReceipt {
            id: event.id,
            topic: event.topic,
            timestamp: event.timestamp,
        })
    }

    /// Append a pre-built envelope, preserving its id and timestamp
    ///
    /// Used by DLQ replay and the scheduler; downstream consumers that
    /// deduplicate on `event.id` observe a replay as a repeat.
    pub async fn publish_event(&self, event: &Event) -> Result<u64> {
        validate_topic(&event.topic)?;
        self.append(event).await
    }

    async fn append(&self, event: &Event) -> Result<u64> {
        let tenant = event.tenant();
        let subject = tenant.event_subject(&event.topic);
        let payload = serde_json::to_vec(event)?;
        let sequence = self
            .gateway
            .append(StreamKind::Events, &subject, payload.into())
            .await?;

        // Best-effort audit row; the stream is the source of truth
        let record = EventRecord {
            id: event.id.clone(),
            topic: event.topic.clone(),
            org: event.org.clone(),
            project: event.project.clone(),
            sequence,
            timestamp: event.timestamp,
        };
        if let Err(e) = self.records.record_event(&record).await {
            tracing::warn!(event_id = %event.id, error = %e, "Failed to write event metadata row");
        }

        Ok(sequence)
    }
}
