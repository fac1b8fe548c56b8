pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taxi_protocol::{DriverView, RideView};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverLocationRecord {
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsRecord {
    pub driver_id: String,
    pub ride_id: String,
    pub amount: f64,
    pub commission: f64,
    pub net_amount: f64,
    pub payment_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub ride_id: Option<String>,
    pub actor: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub actor: Option<String>,
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub const DEFAULT_EVENT_LIMIT: usize = 50;

impl EventFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(actor) = &self.actor {
            if &event.actor != actor {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        true
    }

    /// Newest first, capped at `limit`.
    pub fn apply<'a>(&self, events: impl IntoIterator<Item = &'a AuditEvent>) -> Vec<AuditEvent> {
        let mut matched: Vec<AuditEvent> = events
            .into_iter()
            .filter(|event| self.matches(event))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(self.limit.unwrap_or(DEFAULT_EVENT_LIMIT));
        matched
    }
}

/// Durable audit/history collaborator. Every write is an idempotent upsert
/// keyed by its natural id so that a retried call cannot duplicate rows.
#[async_trait]
pub trait RideStore: Send + Sync {
    async fn upsert_driver(&self, driver: &DriverView) -> anyhow::Result<()>;
    async fn insert_driver_location(&self, record: &DriverLocationRecord) -> anyhow::Result<()>;
    async fn insert_ride(&self, ride: &RideView) -> anyhow::Result<()>;
    /// `ride` carries the new status together with every field the
    /// transition stamped.
    async fn update_ride_status(&self, ride: &RideView) -> anyhow::Result<()>;
    async fn insert_earnings(&self, record: &EarningsRecord) -> anyhow::Result<()>;
    async fn insert_event(&self, event: &AuditEvent) -> anyhow::Result<()>;
    async fn recent_events(&self, filter: &EventFilter) -> anyhow::Result<Vec<AuditEvent>>;
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn event(actor: &str, event_type: &str, minutes_ago: i64) -> AuditEvent {
        AuditEvent {
            id: format!("{actor}-{event_type}-{minutes_ago}"),
            ride_id: None,
            actor: actor.to_string(),
            event_type: event_type.to_string(),
            payload: serde_json::Value::Null,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn filter_by_actor_type_and_time() {
        let events = vec![
            event("driver", "driver:online", 30),
            event("driver", "driver:offline", 5),
            event("passenger", "ride:requested", 1),
        ];
        let filter = EventFilter {
            actor: Some("driver".to_string()),
            since: Some(Utc::now() - Duration::minutes(10)),
            ..Default::default()
        };
        let out = filter.apply(&events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, "driver:offline");
    }

    #[test]
    fn newest_first_and_limited() {
        let events = vec![
            event("system", "a", 3),
            event("system", "b", 1),
            event("system", "c", 2),
        ];
        let filter = EventFilter {
            limit: Some(2),
            ..Default::default()
        };
        let out = filter.apply(&events);
        let types: Vec<_> = out.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["b", "c"]);
    }
}
