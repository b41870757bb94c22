//! Outbound webhooks
//!
//! `signature` signs bodies, `delivery` runs one attempt cycle with retry
//! and audit, `worker` matches events against configs and drives deliveries.

pub mod delivery;
pub mod signature;
pub mod worker;

pub use delivery::{Deliverer, DeliveryOutcome, RetryPolicy};
pub use worker::WebhookWorker;

/// Generate a `whsec_`-prefixed webhook secret, returned to the creator
/// exactly once
pub fn generate_secret() -> String {
    format!("whsec_{}", uuid::Uuid::new_v4().simple())
}

/// Generate a webhook id
pub fn generate_id() -> String {
    format!("wh-{}", uuid::Uuid::new_v4())
}
