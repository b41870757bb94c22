//! Tenant scoping
//!
//! Every operation in the hub carries an `(org, project)` pair resolved once
//! at the edge. Subjects embed the tenant so consumer filters cannot cross
//! tenant boundaries.

use serde::{Deserialize, Serialize};

/// The `(org, project)` pair that scopes every event, subscription, webhook,
/// DLQ entry, and schedule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    pub org: String,
    pub project: String,
}

impl Tenant {
    pub fn new(org: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            project: project.into(),
        }
    }

    /// Subject for a concrete topic on the primary stream
    pub fn event_subject(&self, topic: &str) -> String {
        format!("events.{}.{}.{}", self.org, self.project, topic)
    }

    /// Subject filter for a pattern on the primary stream (wildcards pass
    /// through unchanged)
    pub fn event_filter(&self, pattern: &str) -> String {
        format!("events.{}.{}.{}", self.org, self.project, pattern)
    }

    /// Subject for a topic on the DLQ stream
    pub fn dlq_subject(&self, topic: &str) -> String {
        format!("dlq.{}.{}.{}", self.org, self.project, topic)
    }

    /// Subject filter for a pattern on the DLQ stream
    pub fn dlq_filter(&self, pattern: &str) -> String {
        format!("dlq.{}.{}.{}", self.org, self.project, pattern)
    }

    /// Short form used in consumer names and logs
    pub fn key(&self) -> String {
        format!("{}/{}", self.org, self.project)
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org, self.project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_embed_tenant() {
        let t = Tenant::new("acme", "prod");
        assert_eq!(t.event_subject("orders.new"), "events.acme.prod.orders.new");
        assert_eq!(t.event_filter("orders.*"), "events.acme.prod.orders.*");
        assert_eq!(t.dlq_subject("orders.new"), "dlq.acme.prod.orders.new");
        assert_eq!(t.dlq_filter(">"), "dlq.acme.prod.>");
    }

    #[test]
    fn test_key() {
        assert_eq!(Tenant::new("acme", "prod").key(), "acme/prod");
    }
}
