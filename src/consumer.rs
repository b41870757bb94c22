//! Consumer manager - durable lifecycle and group semantics
//!
//! One durable pull consumer exists per `(tenant, sorted patterns, group)`;
//! every session in the group pulls from the same durable, so each pending
//! message reaches at most one member. Broadcast sessions get a private
//! ephemeral consumer and see every matching message.

use crate::error::Result;
use crate::stream::{ConsumerSpec, StreamConsumer, StreamGateway, StreamKind};
use crate::subject::Pattern;
use crate::tenant::Tenant;
use crate::types::SubscribeOptions;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A consumer bound to one session
pub struct ConsumerBinding {
    pub consumer: Box<dyn StreamConsumer>,

    /// Returned to the manager when the session closes
    pub ticket: ReleaseTicket,
}

impl ConsumerBinding {
    pub fn is_group(&self) -> bool {
        self.ticket.durable.is_some()
    }
}

/// Opaque handle for releasing a binding's durable reference
pub struct ReleaseTicket {
    durable: Option<String>,
}

/// Creates and tracks consumers for subscriptions
pub struct ConsumerManager {
    gateway: Arc<dyn StreamGateway>,

    /// Pending-delivery window applied to every consumer
    prefetch: i64,

    /// One creation lock per durable name, preventing duplicate-create races
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,

    /// Active bindings per durable; the durable is deleted on last release
    refs: Mutex<HashMap<String, usize>>,
}

impl ConsumerManager {
    pub fn new(gateway: Arc<dyn StreamGateway>, prefetch: usize) -> Self {
        Self {
            gateway,
            prefetch: prefetch as i64,
            locks: Mutex::new(HashMap::new()),
            refs: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a consumer for a validated subscription
    pub async fn bind(
        &self,
        tenant: &Tenant,
        patterns: &[Pattern],
        opts: &SubscribeOptions,
    ) -> Result<ConsumerBinding> {
        let filters: Vec<String> = patterns
            .iter()
            .map(|p| tenant.event_filter(p.as_str()))
            .collect();

        let spec = ConsumerSpec {
            filter_subjects: filters,
            ack_wait: opts.ack_wait(),
            max_deliver: opts.max_attempts() as i64,
            deliver_from: opts.from.clone(),
            max_ack_pending: self.prefetch,
        };

        if opts.is_broadcast() {
            let consumer = self.gateway.ephemeral(StreamKind::Events, spec).await?;
            tracing::debug!(tenant = %tenant, "Broadcast consumer created");
            return Ok(ConsumerBinding {
                consumer,
                ticket: ReleaseTicket { durable: None },
            });
        }

        let name = durable_name(tenant, &opts.group, patterns);
        let key_lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(name.clone()).or_default().clone()
        };

        // Serialize lookup/create per durable name
        let _guard = key_lock.lock().await;
        let consumer = self
            .gateway
            .durable(StreamKind::Events, &name, spec)
            .await?;
        {
            let mut refs = self.refs.lock().await;
            *refs.entry(name.clone()).or_insert(0) += 1;
        }

        tracing::info!(
            tenant = %tenant,
            group = %opts.group,
            durable = %name,
            "Group consumer bound"
        );

        Ok(ConsumerBinding {
            consumer,
            ticket: ReleaseTicket {
                durable: Some(name),
            },
        })
    }

    /// Release a binding; the durable is deleted when its last member leaves
    ///
    /// The consumer handle should be dropped before the ticket is released.
    pub async fn release(&self, ticket: ReleaseTicket) {
        let Some(name) = ticket.durable else {
            return;
        };

        let remaining = {
            let mut refs = self.refs.lock().await;
            match refs.get_mut(&name) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    if remaining == 0 {
                        refs.remove(&name);
                    }
                    remaining
                }
                None => return,
            }
        };

        if remaining == 0 {
            if let Err(e) = self
                .gateway
                .delete_consumer(StreamKind::Events, &name)
                .await
            {
                tracing::warn!(durable = %name, error = %e, "Failed to delete released durable");
            }
            self.locks.lock().await.remove(&name);
            tracing::info!(durable = %name, "Durable deleted on last release");
        }
    }
}

/// Deterministic durable name for `(tenant, group, sorted patterns)`
///
/// Restarts re-attach to the same durable, so attempt progression survives
/// reconnects. The raw parts are hashed because pattern characters are not
/// valid in consumer names.
fn durable_name(tenant: &Tenant, group: &str, patterns: &[Pattern]) -> String {
    let mut sorted: Vec<&str> = patterns.iter().map(|p| p.as_str()).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(tenant.org.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(tenant.project.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(group.as_bytes());
    for pattern in &sorted {
        hasher.update(b"\x1f");
        hasher.update(pattern.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());

    format!("grp-{}-{}", sanitize(group), &digest[..16])
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryGateway;
    use crate::types::StartFrom;

    fn patterns(raw: &[&str]) -> Vec<Pattern> {
        raw.iter().map(|s| Pattern::parse(s).unwrap()).collect()
    }

    fn group_opts(group: &str) -> SubscribeOptions {
        SubscribeOptions {
            group: group.to_string(),
            from: StartFrom::Beginning,
            ..Default::default()
        }
    }

    #[test]
    fn test_durable_name_is_deterministic() {
        let tenant = Tenant::new("acme", "prod");
        let a = durable_name(&tenant, "worker", &patterns(&["orders.*", "billing.>"]));
        let b = durable_name(&tenant, "worker", &patterns(&["billing.>", "orders.*"]));
        assert_eq!(a, b, "pattern order must not matter");
        assert!(a.starts_with("grp-worker-"));
    }

    #[test]
    fn test_durable_name_varies_by_inputs() {
        let tenant = Tenant::new("acme", "prod");
        let base = durable_name(&tenant, "worker", &patterns(&["orders.*"]));
        assert_ne!(
            base,
            durable_name(&tenant, "other", &patterns(&["orders.*"]))
        );
        assert_ne!(
            base,
            durable_name(&tenant, "worker", &patterns(&["orders.>"]))
        );
        assert_ne!(
            base,
            durable_name(&Tenant::new("rival", "prod"), "worker", &patterns(&["orders.*"]))
        );
    }

    #[test]
    fn test_sanitize_strips_separators() {
        assert_eq!(sanitize("team.a b"), "team--a-b");
        assert_eq!(sanitize("worker_1"), "worker_1");
    }

    #[tokio::test]
    async fn test_group_bindings_share_one_durable() {
        let gateway = Arc::new(MemoryGateway::new());
        let manager = ConsumerManager::new(gateway.clone(), 64);
        let tenant = Tenant::new("acme", "prod");
        let pats = patterns(&["orders.*"]);

        let b1 = manager.bind(&tenant, &pats, &group_opts("worker")).await.unwrap();
        let b2 = manager.bind(&tenant, &pats, &group_opts("worker")).await.unwrap();
        assert!(b1.is_group());
        assert_eq!(gateway.info(StreamKind::Events).await.unwrap().consumers, 1);

        drop(b1.consumer);
        manager.release(b1.ticket).await;
        assert_eq!(gateway.info(StreamKind::Events).await.unwrap().consumers, 1);

        drop(b2.consumer);
        manager.release(b2.ticket).await;
        assert_eq!(gateway.info(StreamKind::Events).await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_broadcast_bindings_are_private() {
        let gateway = Arc::new(MemoryGateway::new());
        let manager = ConsumerManager::new(gateway.clone(), 64);
        let tenant = Tenant::new("acme", "prod");
        let pats = patterns(&["orders.*"]);
        let opts = SubscribeOptions {
            from: StartFrom::Beginning,
            ..Default::default()
        };

        let b1 = manager.bind(&tenant, &pats, &opts).await.unwrap();
        let b2 = manager.bind(&tenant, &pats, &opts).await.unwrap();
        assert!(!b1.is_group());
        assert_eq!(gateway.info(StreamKind::Events).await.unwrap().consumers, 2);

        drop(b1.consumer);
        manager.release(b1.ticket).await;
        drop(b2.consumer);
        manager.release(b2.ticket).await;
        assert_eq!(gateway.info(StreamKind::Events).await.unwrap().consumers, 0);
    }
}
