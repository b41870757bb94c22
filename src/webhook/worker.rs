//! Webhook worker - broadcast consumer feeding outbound deliveries
//!
//! Owns a private durable on `events.>` so crash recovery resumes exactly
//! where it left off. For each event it matches the tenant's enabled
//! webhook configs through the subject matcher (cached with a short TTL,
//! invalidated on config mutation) and runs one delivery cycle per match.
//! Exhausted deliveries escalate to the DLQ tagged `webhook:<id>`.

use crate::config::WebhookConfig;
use crate::dlq::DlqService;
use crate::error::Result;
use crate::store::{Webhook, WebhookStore};
use crate::stream::{ConsumerSpec, StreamGateway, StreamKind};
use crate::subject::Pattern;
use crate::tenant::Tenant;
use crate::types::{Event, StartFrom};
use crate::webhook::delivery::{Deliverer, DeliveryOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Durable name for the worker's private consumer
const WORKER_DURABLE: &str = "webhook-worker";

/// Stream-level redelivery bound; the worker acks every event it fully
/// processes, so this only limits poison loops after repeated crashes
const WORKER_MAX_DELIVER: i64 = 3;

struct CachedConfigs {
    fetched_at: Instant,
    revision: u64,
    hooks: Vec<(Webhook, Vec<Pattern>)>,
}

/// Long-running delivery worker
pub struct WebhookWorker {
    gateway: Arc<dyn StreamGateway>,
    webhooks: Arc<dyn WebhookStore>,
    dlq: Arc<DlqService>,
    deliverer: Arc<Deliverer>,
    config: WebhookConfig,

    /// Per-tenant compiled config cache
    cache: Mutex<HashMap<Tenant, CachedConfigs>>,

    /// Bounds total in-flight delivery jobs
    jobs: Arc<Semaphore>,

    /// Bounds concurrent deliveries per endpoint
    endpoints: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl WebhookWorker {
    pub fn new(
        gateway: Arc<dyn StreamGateway>,
        webhooks: Arc<dyn WebhookStore>,
        dlq: Arc<DlqService>,
        deliverer: Arc<Deliverer>,
        config: WebhookConfig,
    ) -> Self {
        let jobs = Arc::new(Semaphore::new(config.job_queue));
        Self {
            gateway,
            webhooks,
            dlq,
            deliverer,
            config,
            cache: Mutex::new(HashMap::new()),
            jobs,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Pull events until shutdown; each event is acked only after every
    /// matched delivery resolved, preserving at-least-once through crashes
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let spec = ConsumerSpec {
            filter_subjects: vec!["events.>".to_string()],
            ack_wait: Duration::from_secs(self.config.ack_wait_secs),
            max_deliver: WORKER_MAX_DELIVER,
            deliver_from: StartFrom::Latest,
            max_ack_pending: self.config.max_ack_pending,
        };
        let mut consumer = self
            .gateway
            .durable(StreamKind::Events, WORKER_DURABLE, spec)
            .await?;

        tracing::info!("Webhook worker started");
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished event tasks without blocking
            while tasks.try_join_next().is_some() {}

            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => next,
            };
            match next {
                Ok(Some(msg)) => {
                    let worker = self.clone();
                    let token = shutdown.clone();
                    tasks.spawn(async move {
                        worker.process(msg, token).await;
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Webhook worker pull failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        // In-flight work is abandoned; unacked events stay on the stream
        // for the next instance
        tasks.abort_all();
        tracing::info!("Webhook worker stopped");
        Ok(())
    }

    async fn process(&self, msg: crate::stream::PendingMessage, shutdown: CancellationToken) {
        let event: Event = match serde_json::from_slice(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(sequence = msg.sequence, error = %e, "Undecodable event, acking past it");
                let _ = msg.ack().await;
                return;
            }
        };

        let tenant = event.tenant();
        let matched = match self.matching_webhooks(&tenant, &event.topic).await {
            Ok(matched) => matched,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Config lookup failed, redelivering");
                let _ = msg.nack(Some(Duration::from_secs(5))).await;
                return;
            }
        };

        for webhook in matched {
            if shutdown.is_cancelled() {
                // Unacked; the next instance picks the event up again
                return;
            }
            self.deliver_one(&webhook, &event, &shutdown).await;
        }

        if let Err(e) = msg.ack().await {
            tracing::warn!(event_id = %event.id, error = %e, "Worker ack failed");
        }
    }

    async fn deliver_one(&self, webhook: &Webhook, event: &Event, shutdown: &CancellationToken) {
        let endpoint = self.endpoint_semaphore(&webhook.id).await;
        let Ok(_job) = self.jobs.acquire().await else {
            return;
        };
        let Ok(_slot) = endpoint.acquire().await else {
            return;
        };

        match self.deliverer.deliver(webhook, event, shutdown).await {
            DeliveryOutcome::Delivered { .. } => {}
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                if shutdown.is_cancelled() {
                    return;
                }
                let group = format!("webhook:{}", webhook.id);
                if let Err(e) = self
                    .dlq
                    .write(event.clone(), attempts as u64, &last_error, group)
                    .await
                {
                    tracing::error!(
                        event_id = %event.id,
                        webhook = %webhook.id,
                        error = %e,
                        "DLQ escalation failed"
                    );
                }
            }
        }
    }

    /// Enabled webhooks whose patterns match the topic, via the TTL cache
    async fn matching_webhooks(&self, tenant: &Tenant, topic: &str) -> Result<Vec<Webhook>> {
        let mut cache = self.cache.lock().await;
        let ttl = Duration::from_secs(self.config.config_cache_ttl_secs);
        let revision = self.webhooks.revision().await?;

        let stale = match cache.get(tenant) {
            Some(entry) => entry.fetched_at.elapsed() > ttl || entry.revision != revision,
            None => true,
        };
        if stale {
            let hooks = self.webhooks.enabled_webhooks(tenant).await?;
            let compiled = hooks
                .into_iter()
                .map(|hook| {
                    let patterns = hook
                        .topics
                        .iter()
                        .filter_map(|t| Pattern::parse(t).ok())
                        .collect();
                    (hook, patterns)
                })
                .collect();
            cache.insert(
                tenant.clone(),
                CachedConfigs {
                    fetched_at: Instant::now(),
                    revision,
                    hooks: compiled,
                },
            );
        }

        let entry = cache.get(tenant).map(|entry| {
            entry
                .hooks
                .iter()
                .filter(|(_, patterns)| patterns.iter().any(|p| p.matches(topic)))
                .map(|(hook, _)| hook.clone())
                .collect()
        });
        Ok(entry.unwrap_or_default())
    }

    async fn endpoint_semaphore(&self, webhook_id: &str) -> Arc<Semaphore> {
        let mut endpoints = self.endpoints.lock().await;
        endpoints
            .entry(webhook_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_endpoint_concurrency)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::Publisher;
    use crate::store::MemoryStore;
    use crate::stream::MemoryGateway;
    use chrono::Utc;

    fn webhook(id: &str, topics: &[&str], enabled: bool) -> Webhook {
        Webhook {
            id: id.to_string(),
            url: "http://127.0.0.1:1/unreachable".to_string(),
            topics: topics.iter().map(|s| s.to_string()).collect(),
            secret: "whsec_test".to_string(),
            enabled,
            org: "acme".to_string(),
            project: "prod".to_string(),
            created_at: Utc::now(),
        }
    }

    fn worker_with_store() -> (Arc<WebhookWorker>, Arc<MemoryStore>) {
        let gateway: Arc<MemoryGateway> = Arc::new(MemoryGateway::new());
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(Publisher::new(gateway.clone(), store.clone(), 1024 * 1024));
        let dlq = Arc::new(DlqService::new(gateway.clone(), publisher));
        let config = WebhookConfig {
            config_cache_ttl_secs: 60,
            ..Default::default()
        };
        let deliverer = Arc::new(Deliverer::new(store.clone(), &config));
        let worker = Arc::new(WebhookWorker::new(
            gateway,
            store.clone(),
            dlq,
            deliverer,
            config,
        ));
        (worker, store)
    }

    #[tokio::test]
    async fn test_matching_respects_patterns_and_enabled() {
        let (worker, store) = worker_with_store();
        let tenant = Tenant::new("acme", "prod");
        store
            .create_webhook(&webhook("wh-orders", &["orders.*"], true))
            .await
            .unwrap();
        store
            .create_webhook(&webhook("wh-all", &[">"], true))
            .await
            .unwrap();
        store
            .create_webhook(&webhook("wh-disabled", &["orders.*"], false))
            .await
            .unwrap();

        let matched = worker
            .matching_webhooks(&tenant, "orders.new")
            .await
            .unwrap();
        let ids: Vec<&str> = matched.iter().map(|w| w.id.as_str()).collect();
        assert!(ids.contains(&"wh-orders"));
        assert!(ids.contains(&"wh-all"));
        assert!(!ids.contains(&"wh-disabled"));

        let matched = worker
            .matching_webhooks(&tenant, "billing.paid")
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "wh-all");
    }

    #[tokio::test]
    async fn test_cache_invalidates_on_mutation() {
        let (worker, store) = worker_with_store();
        let tenant = Tenant::new("acme", "prod");
        store
            .create_webhook(&webhook("wh-1", &["orders.*"], true))
            .await
            .unwrap();

        assert_eq!(
            worker
                .matching_webhooks(&tenant, "orders.new")
                .await
                .unwrap()
                .len(),
            1
        );

        // Disable the webhook; the revision bump must bypass the warm cache
        let mut updated = webhook("wh-1", &["orders.*"], false);
        updated.created_at = Utc::now();
        store.update_webhook(&updated).await.unwrap();

        assert!(worker
            .matching_webhooks(&tenant, "orders.new")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_tenant_isolation_in_matching() {
        let (worker, store) = worker_with_store();
        store
            .create_webhook(&webhook("wh-1", &[">"], true))
            .await
            .unwrap();

        let rival = Tenant::new("rival", "prod");
        assert!(worker
            .matching_webhooks(&rival, "orders.new")
            .await
            .unwrap()
            .is_empty());
    }
}
