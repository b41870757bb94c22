//! Outbound webhook delivery
//!
//! One delivery cycle POSTs the raw event JSON with a signed body, retrying
//! on any non-2xx outcome with exponential backoff and full jitter until the
//! attempt budget runs out. Every attempt writes an audit row.

use crate::config::WebhookConfig;
use crate::store::{DeliveryRecord, DeliveryStatus, DeliveryStore, Webhook};
use crate::types::Event;
use crate::webhook::signature;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with full jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &WebhookConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_backoff: Duration::from_millis(cfg.base_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }

    /// Delay before the given retry (attempt is 1-based; attempt 1 has no delay)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << (attempt - 2).min(16));
        let ceiling = exp.min(self.max_backoff);
        // Full jitter: uniform in [0, ceiling]
        let millis = ceiling.as_millis() as u64;
        let jittered = if millis == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=millis)
        };
        Duration::from_millis(jittered)
    }
}

/// Terminal result of a delivery cycle
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Delivered {
        attempts: u32,
    },
    Exhausted {
        attempts: u32,
        last_error: String,
    },
}

/// Performs signed deliveries with retry and audit
pub struct Deliverer {
    http: reqwest::Client,
    deliveries: Arc<dyn DeliveryStore>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl Deliverer {
    pub fn new(deliveries: Arc<dyn DeliveryStore>, cfg: &WebhookConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            deliveries,
            policy: RetryPolicy::from_config(cfg),
            attempt_timeout: Duration::from_secs(cfg.attempt_timeout_secs),
        }
    }

    /// Run the full attempt cycle for one `(webhook, event)` pair
    pub async fn deliver(
        &self,
        webhook: &Webhook,
        event: &Event,
        shutdown: &CancellationToken,
    ) -> DeliveryOutcome {
        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryOutcome::Exhausted {
                    attempts: 0,
                    last_error: format!("failed to encode event: {e}"),
                }
            }
        };
        let sig = signature::sign(&webhook.secret, &body);

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => {
                        // Leave the event on the stream for the next instance
                        return DeliveryOutcome::Exhausted {
                            attempts: attempt - 1,
                            last_error: "shutdown during retry backoff".to_string(),
                        };
                    }
                }
            }

            let outcome = self.attempt(webhook, event, &body, &sig).await;
            let record = DeliveryRecord {
                webhook_id: webhook.id.clone(),
                event_id: event.id.clone(),
                topic: event.topic.clone(),
                attempt,
                status: if outcome.is_ok() {
                    DeliveryStatus::Success
                } else {
                    DeliveryStatus::Failed
                },
                response_status: match &outcome {
                    Ok(status) => Some(*status),
                    Err(AttemptError::Status(status)) => Some(*status),
                    Err(AttemptError::Transport(_)) => None,
                },
                error: outcome.as_ref().err().map(|e| e.to_string()),
                created_at: Utc::now(),
                delivered_at: outcome.is_ok().then(Utc::now),
            };
            if let Err(e) = self.deliveries.record_delivery(&record).await {
                tracing::warn!(webhook = %webhook.id, error = %e, "Failed to write delivery record");
            }

            match outcome {
                Ok(status) => {
                    tracing::info!(
                        webhook = %webhook.id,
                        event_id = %event.id,
                        attempt = attempt,
                        status = status,
                        "Webhook delivered"
                    );
                    return DeliveryOutcome::Delivered { attempts: attempt };
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        webhook = %webhook.id,
                        event_id = %event.id,
                        attempt = attempt,
                        error = %last_error,
                        "Webhook delivery attempt failed"
                    );
                }
            }
        }

        DeliveryOutcome::Exhausted {
            attempts: self.policy.max_attempts,
            last_error,
        }
    }

    async fn attempt(
        &self,
        webhook: &Webhook,
        event: &Event,
        body: &[u8],
        sig: &str,
    ) -> std::result::Result<u16, AttemptError> {
        let response = self
            .http
            .post(&webhook.url)
            .timeout(self.attempt_timeout)
            .header("Content-Type", "application/json")
            .header("X-Notif-Event-Id", &event.id)
            .header("X-Notif-Topic", &event.topic)
            .header("X-Notif-Signature", sig)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(AttemptError::Status(status.as_u16()))
        }
    }
}

#[derive(Debug)]
enum AttemptError {
    Status(u16),
    Transport(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(status) => write!(f, "HTTP {status}"),
            Self::Transport(e) => write!(f, "request failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, WebhookStore};
    use crate::tenant::Tenant;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config() -> WebhookConfig {
        WebhookConfig {
            max_attempts: 3,
            base_backoff_ms: 10,
            max_backoff_ms: 50,
            attempt_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn webhook(url: &str) -> Webhook {
        Webhook {
            id: "wh-1".to_string(),
            url: url.to_string(),
            topics: vec!["billing.*".to_string()],
            secret: "whsec_test".to_string(),
            enabled: true,
            org: "acme".to_string(),
            project: "prod".to_string(),
            created_at: Utc::now(),
        }
    }

    fn event() -> Event {
        Event::new(
            "billing.paid",
            serde_json::json!({"amt": 1}),
            &Tenant::new("acme", "prod"),
        )
    }

    /// Bind a throwaway receiver returning the given status codes in order
    async fn receiver(statuses: Vec<u16>) -> (String, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_handler = hits.clone();
        let app = Router::new().route(
            "/hook",
            post(move || {
                let hits = hits_handler.clone();
                let statuses = statuses.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) as usize;
                    let status = statuses.get(n).copied().unwrap_or(200);
                    axum::http::StatusCode::from_u16(status).unwrap()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/hook"), hits)
    }

    #[test]
    fn test_delay_before_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        for attempt in 2..=6 {
            let ceiling = Duration::from_millis(100)
                .saturating_mul(1 << (attempt - 2))
                .min(Duration::from_millis(400));
            for _ in 0..20 {
                assert!(policy.delay_before(attempt) <= ceiling);
            }
        }
    }

    #[tokio::test]
    async fn test_deliver_success_first_attempt() {
        let (url, hits) = receiver(vec![200]).await;
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(store.clone(), &test_config());

        let outcome = deliverer
            .deliver(&webhook(&url), &event(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 1 }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deliver_retries_then_succeeds() {
        let (url, hits) = receiver(vec![500, 503, 200]).await;
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(store.clone(), &test_config());

        let outcome = deliverer
            .deliver(&webhook(&url), &event(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Delivered { attempts: 3 }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deliver_exhausts_attempts() {
        let (url, hits) = receiver(vec![500, 500, 500, 500]).await;
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(store.clone(), &test_config());

        let outcome = deliverer
            .deliver(&webhook(&url), &event(), &CancellationToken::new())
            .await;
        match outcome {
            DeliveryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("500"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_every_attempt_writes_a_record() {
        let (url, _) = receiver(vec![500, 200]).await;
        let store = Arc::new(MemoryStore::new());
        let deliverer = Deliverer::new(store.clone(), &test_config());
        let wh = webhook(&url);
        store.create_webhook(&wh).await.unwrap();

        deliverer
            .deliver(&wh, &event(), &CancellationToken::new())
            .await;

        let tenant = Tenant::new("acme", "prod");
        let records = store.list_deliveries(&tenant, "wh-1", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        // Newest first
        assert_eq!(records[0].status, DeliveryStatus::Success);
        assert_eq!(records[0].attempt, 2);
        assert_eq!(records[1].status, DeliveryStatus::Failed);
        assert_eq!(records[1].response_status, Some(500));
    }
}
