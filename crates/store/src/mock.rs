use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use taxi_protocol::{DriverView, RideView};

use crate::{AuditEvent, DriverLocationRecord, EarningsRecord, EventFilter, RideStore};

/// In-memory store for tests and store-less runs. `set_failing(true)`
/// makes every call return an error.
#[derive(Clone, Default)]
pub struct MemoryStore {
    drivers: Arc<Mutex<HashMap<String, DriverView>>>,
    locations: Arc<Mutex<Vec<DriverLocationRecord>>>,
    rides: Arc<Mutex<HashMap<String, RideView>>>,
    earnings: Arc<Mutex<HashMap<(String, String), EarningsRecord>>>,
    events: Arc<Mutex<Vec<AuditEvent>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable")
        }
        Ok(())
    }

    pub fn driver(&self, driver_id: &str) -> Option<DriverView> {
        self.drivers.lock().expect("drivers lock").get(driver_id).cloned()
    }

    pub fn ride(&self, ride_id: &str) -> Option<RideView> {
        self.rides.lock().expect("rides lock").get(ride_id).cloned()
    }

    pub fn locations(&self) -> Vec<DriverLocationRecord> {
        self.locations.lock().expect("locations lock").clone()
    }

    pub fn earnings(&self) -> Vec<EarningsRecord> {
        self.earnings
            .lock()
            .expect("earnings lock")
            .values()
            .cloned()
            .collect()
    }

    /// Event types in insertion order.
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .map(|event| event.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl RideStore for MemoryStore {
    async fn upsert_driver(&self, driver: &DriverView) -> anyhow::Result<()> {
        self.check()?;
        self.drivers
            .lock()
            .expect("drivers lock")
            .insert(driver.driver_id.clone(), driver.clone());
        Ok(())
    }

    async fn insert_driver_location(&self, record: &DriverLocationRecord) -> anyhow::Result<()> {
        self.check()?;
        self.locations
            .lock()
            .expect("locations lock")
            .push(record.clone());
        Ok(())
    }

    async fn insert_ride(&self, ride: &RideView) -> anyhow::Result<()> {
        self.check()?;
        self.rides
            .lock()
            .expect("rides lock")
            .insert(ride.ride_id.clone(), ride.clone());
        Ok(())
    }

    async fn update_ride_status(&self, ride: &RideView) -> anyhow::Result<()> {
        self.insert_ride(ride).await
    }

    async fn insert_earnings(&self, record: &EarningsRecord) -> anyhow::Result<()> {
        self.check()?;
        self.earnings.lock().expect("earnings lock").insert(
            (record.driver_id.clone(), record.ride_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn insert_event(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.check()?;
        let mut events = self.events.lock().expect("events lock");
        match events.iter_mut().find(|existing| existing.id == event.id) {
            Some(existing) => *existing = event.clone(),
            None => events.push(event.clone()),
        }
        Ok(())
    }

    async fn recent_events(&self, filter: &EventFilter) -> anyhow::Result<Vec<AuditEvent>> {
        self.check()?;
        let events = self.events.lock().expect("events lock");
        Ok(filter.apply(events.iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn earnings(amount: f64) -> EarningsRecord {
        EarningsRecord {
            driver_id: "d1".to_string(),
            ride_id: "r1".to_string(),
            amount,
            commission: amount * 0.15,
            net_amount: amount * 0.85,
            payment_status: "pending".to_string(),
        }
    }

    #[tokio::test]
    async fn retried_writes_do_not_duplicate() {
        let store = MemoryStore::new();
        store.insert_earnings(&earnings(12.5)).await.unwrap();
        store.insert_earnings(&earnings(12.5)).await.unwrap();
        assert_eq!(store.earnings().len(), 1);
    }

    #[tokio::test]
    async fn failing_store_reports_errors() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(store.insert_earnings(&earnings(1.0)).await.is_err());
        store.set_failing(false);
        assert!(store.insert_earnings(&earnings(1.0)).await.is_ok());
    }
}
