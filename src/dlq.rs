//! Dead letter queue - terminal-failure envelopes on a sibling stream
//!
//! Events that exhaust their per-sink attempt budget land here with the
//! failure context attached. Entries can be listed, fetched, replayed back
//! through the publisher, and deleted, always scoped to the owning tenant.

use crate::error::{HubError, Result};
use crate::publish::Publisher;
use crate::stream::{StoredEntry, StreamGateway, StreamKind};
use crate::subject::Pattern;
use crate::tenant::Tenant;
use crate::types::{DlqEntry, DlqEnvelope, Event};
use std::sync::Arc;

/// Writes and manages DLQ entries
pub struct DlqService {
    gateway: Arc<dyn StreamGateway>,
    publisher: Arc<Publisher>,
}

impl DlqService {
    pub fn new(gateway: Arc<dyn StreamGateway>, publisher: Arc<Publisher>) -> Self {
        Self { gateway, publisher }
    }

    /// Append a failure envelope for an exhausted event
    pub async fn write(
        &self,
        event: Event,
        attempts: u64,
        last_error: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Result<u64> {
        let envelope = DlqEnvelope::new(event, attempts, last_error, consumer_group);
        let tenant = envelope.event.tenant();
        let subject = tenant.dlq_subject(&envelope.original_topic);
        let payload = serde_json::to_vec(&envelope)?;
        let sequence = self
            .gateway
            .append(StreamKind::Dlq, &subject, payload.into())
            .await?;

        tracing::warn!(
            event_id = %envelope.event.id,
            topic = %envelope.original_topic,
            attempts = envelope.attempts,
            group = %envelope.consumer_group,
            last_error = %envelope.last_error,
            sequence = sequence,
            "Event dead-lettered"
        );

        Ok(sequence)
    }

    /// List entries for a tenant, optionally narrowed by a topic pattern
    pub async fn list(
        &self,
        tenant: &Tenant,
        topic_filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DlqEntry>> {
        let filter = self.subject_filter(tenant, topic_filter)?;
        let entries = self.gateway.scan(StreamKind::Dlq, &filter, limit).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| self.decode_owned(tenant, entry))
            .collect())
    }

    /// Fetch a single entry; cross-tenant sequences read as `NotFound`
    pub async fn get(&self, tenant: &Tenant, sequence: u64) -> Result<DlqEntry> {
        let entry = self
            .gateway
            .get(StreamKind::Dlq, sequence)
            .await?
            .and_then(|entry| self.decode_owned(tenant, entry));
        entry.ok_or_else(|| HubError::NotFound(format!("dlq entry {sequence}")))
    }

    /// Re-publish the original envelope; the DLQ entry stays in place
    ///
    /// The replayed event keeps its original id, so consumers deduplicating
    /// on `event.id` observe a repeat rather than a new event.
    pub async fn replay(&self, tenant: &Tenant, sequence: u64) -> Result<Event> {
        let entry = self.get(tenant, sequence).await?;
        self.publisher.publish_event(&entry.envelope.event).await?;

        tracing::info!(
            event_id = %entry.envelope.event.id,
            topic = %entry.envelope.original_topic,
            sequence = sequence,
            "DLQ entry replayed"
        );

        Ok(entry.envelope.event)
    }

    /// Delete a single entry after verifying ownership
    pub async fn delete(&self, tenant: &Tenant, sequence: u64) -> Result<()> {
        // Ownership check before the mutation
        self.get(tenant, sequence).await?;
        let deleted = self.gateway.delete(StreamKind::Dlq, sequence).await?;
        if !deleted {
            return Err(HubError::NotFound(format!("dlq entry {sequence}")));
        }
        Ok(())
    }

    /// Replay every matching entry; returns how many were re-published
    pub async fn replay_all(&self, tenant: &Tenant, topic_filter: Option<&str>) -> Result<usize> {
        let entries = self.list(tenant, topic_filter, usize::MAX >> 1).await?;
        let mut replayed = 0;
        for entry in entries {
            self.publisher.publish_event(&entry.envelope.event).await?;
            replayed += 1;
        }
        tracing::info!(tenant = %tenant, count = replayed, "DLQ replay-all finished");
        Ok(replayed)
    }

    /// Delete every matching entry; returns how many were removed
    pub async fn purge(&self, tenant: &Tenant, topic_filter: Option<&str>) -> Result<usize> {
        let entries = self.list(tenant, topic_filter, usize::MAX >> 1).await?;
        let mut purged = 0;
        for entry in entries {
            if self.gateway.delete(StreamKind::Dlq, entry.sequence).await? {
                purged += 1;
            }
        }
        tracing::info!(tenant = %tenant, count = purged, "DLQ purge finished");
        Ok(purged)
    }

    fn subject_filter(&self, tenant: &Tenant, topic_filter: Option<&str>) -> Result<String> {
        match topic_filter {
            Some(raw) => {
                let pattern = Pattern::parse(raw)?;
                Ok(tenant.dlq_filter(pattern.as_str()))
            }
            None => Ok(tenant.dlq_filter(">")),
        }
    }

    /// Decode an entry and verify the envelope's tenant matches the caller
    fn decode_owned(&self, tenant: &Tenant, entry: StoredEntry) -> Option<DlqEntry> {
        let envelope: DlqEnvelope = match serde_json::from_slice(&entry.payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(sequence = entry.sequence, error = %e, "Undecodable DLQ entry");
                return None;
            }
        };
        if envelope.event.org != tenant.org || envelope.event.project != tenant.project {
            return None;
        }
        Some(DlqEntry {
            sequence: entry.sequence,
            envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::stream::MemoryGateway;

    fn service() -> (DlqService, Arc<MemoryGateway>) {
        let gateway: Arc<MemoryGateway> = Arc::new(MemoryGateway::new());
        let publisher = Arc::new(Publisher::new(
            gateway.clone(),
            Arc::new(MemoryStore::new()),
            1024 * 1024,
        ));
        (DlqService::new(gateway.clone(), publisher), gateway)
    }

    fn tenant() -> Tenant {
        Tenant::new("acme", "prod")
    }

    fn event(topic: &str) -> Event {
        Event::new(topic, serde_json::json!({"n": 1}), &tenant())
    }

    #[tokio::test]
    async fn test_write_and_list() {
        let (dlq, _) = service();
        dlq.write(event("orders.new"), 4, "nacked", "worker")
            .await
            .unwrap();

        let entries = dlq.list(&tenant(), None, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.attempts, 4);
        assert_eq!(entries[0].envelope.consumer_group, "worker");
        assert_eq!(entries[0].envelope.original_topic, "orders.new");
    }

    #[tokio::test]
    async fn test_list_with_topic_filter() {
        let (dlq, _) = service();
        dlq.write(event("orders.new"), 1, "e", "").await.unwrap();
        dlq.write(event("billing.paid"), 1, "e", "").await.unwrap();

        let entries = dlq.list(&tenant(), Some("orders.*"), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].envelope.original_topic, "orders.new");
    }

    #[tokio::test]
    async fn test_cross_tenant_reads_as_not_found() {
        let (dlq, _) = service();
        let seq = dlq.write(event("orders.new"), 1, "e", "").await.unwrap();

        let rival = Tenant::new("rival", "prod");
        assert!(dlq.list(&rival, None, 10).await.unwrap().is_empty());
        assert!(matches!(
            dlq.get(&rival, seq).await.unwrap_err(),
            HubError::NotFound(_)
        ));
        assert!(matches!(
            dlq.delete(&rival, seq).await.unwrap_err(),
            HubError::NotFound(_)
        ));
        // Still present for the owner
        assert!(dlq.get(&tenant(), seq).await.is_ok());
    }

    #[tokio::test]
    async fn test_replay_preserves_event_id_and_keeps_entry() {
        let (dlq, gateway) = service();
        let original = event("orders.new");
        let id = original.id.clone();
        let seq = dlq.write(original, 4, "e", "").await.unwrap();

        let replayed = dlq.replay(&tenant(), seq).await.unwrap();
        assert_eq!(replayed.id, id);

        // Entry stays until explicitly deleted
        assert!(dlq.get(&tenant(), seq).await.is_ok());

        let events = gateway
            .scan(StreamKind::Events, "events.acme.prod.>", 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let stored: Event = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(stored.id, id);
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let (dlq, _) = service();
        let seq = dlq.write(event("orders.new"), 1, "e", "").await.unwrap();
        dlq.write(event("orders.old"), 1, "e", "").await.unwrap();
        dlq.write(event("billing.paid"), 1, "e", "").await.unwrap();

        dlq.delete(&tenant(), seq).await.unwrap();
        assert!(dlq.get(&tenant(), seq).await.is_err());

        let purged = dlq.purge(&tenant(), Some("orders.>")).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(dlq.list(&tenant(), None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_all() {
        let (dlq, gateway) = service();
        dlq.write(event("orders.a"), 1, "e", "").await.unwrap();
        dlq.write(event("orders.b"), 1, "e", "").await.unwrap();

        let replayed = dlq.replay_all(&tenant(), None).await.unwrap();
        assert_eq!(replayed, 2);
        let events = gateway
            .scan(StreamKind::Events, "events.>", 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }
}
