//! The dispatch engine: one shared state behind a single async lock, with
//! routing and persistence calls made only after the guard is released.

mod queries;
mod rides;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use taxi_common::config::DispatchConfig;
use taxi_common::ids::{new_event_id, new_session_id};
use taxi_geo::{Coordinate, GeoEstimator};
use taxi_protocol::{ConnectDriver, ConnectPassenger, DriverView, LocationUpdate, PassengerView};
use taxi_store::{AuditEvent, DriverLocationRecord, RideStore};

use crate::error::{validation, DispatchError};
use crate::fanout::EventSender;
use crate::fare::FareCalculator;
use crate::lifecycle::{Departure, Disconnected, EngineState};
use crate::presence::{DriverDescriptor, Participant, PassengerDescriptor};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub radius_km: f64,
    pub request_timeout: Duration,
    pub commission_rate: f64,
    pub fares: FareCalculator,
    pub retention: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            radius_km: config.ride.radius_km,
            request_timeout: config.ride.request_timeout(),
            commission_rate: config.ride.commission_rate,
            fares: FareCalculator::from_config(&config.fare),
            retention: config.maintenance.retention(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// A transport session: its id and the channel its writer drains.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub tx: EventSender,
}

impl Session {
    pub fn new(tx: EventSender) -> Self {
        Self {
            id: new_session_id(),
            tx,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub drivers_online: usize,
    pub drivers_available: usize,
    pub passengers: usize,
    pub live_rides: usize,
    pub completed_rides: usize,
    pub cancelled_rides: usize,
    pub connected_clients: usize,
}

struct EngineInner {
    state: RwLock<EngineState>,
    settings: EngineSettings,
    geo: GeoEstimator,
    store: Arc<dyn RideStore>,
}

#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    pub fn new(settings: EngineSettings, geo: GeoEstimator, store: Arc<dyn RideStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: RwLock::new(EngineState::new()),
                settings,
                geo,
                store,
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Which driver or passenger the session currently speaks for. A session
    /// whose identity was taken over by a newer connection gets `None`.
    pub async fn identify(&self, session_id: &str) -> Option<Participant> {
        let state = self.inner.state.read().await;
        state.presence.participant_for_session(session_id).cloned()
    }

    pub async fn connect_driver(
        &self,
        session: &Session,
        payload: ConnectDriver,
    ) -> Result<DriverView, DispatchError> {
        let descriptor = DriverDescriptor::from(payload);
        descriptor.validate()?;
        let now = Utc::now();
        let driver = {
            let mut state = self.inner.state.write().await;
            state.connect_driver(descriptor, &session.id, session.tx.clone(), now)?
        };
        info!(driver_id = %driver.driver_id, session = %session.id, "driver connected");

        let view = driver.view();
        self.persist("upsert driver", self.inner.store.upsert_driver(&view).await);
        self.audit(
            None,
            "driver",
            "driver:online",
            serde_json::json!({
                "driver_id": view.driver_id,
                "latitude": view.latitude,
                "longitude": view.longitude,
            }),
        )
        .await;
        Ok(view)
    }

    pub async fn connect_passenger(
        &self,
        session: &Session,
        payload: ConnectPassenger,
    ) -> Result<PassengerView, DispatchError> {
        let descriptor = PassengerDescriptor::from(payload);
        descriptor.validate()?;
        let passenger = {
            let mut state = self.inner.state.write().await;
            state.connect_passenger(descriptor, &session.id, session.tx.clone(), Utc::now())?
        };
        info!(passenger_id = %passenger.passenger_id, session = %session.id, "passenger connected");
        Ok(passenger.view())
    }

    /// Unknown drivers are ignored.
    pub async fn update_location(
        &self,
        driver_id: &str,
        update: LocationUpdate,
    ) -> Result<(), DispatchError> {
        let location = Coordinate::new(update.latitude, update.longitude);
        if !location.is_valid() {
            return Err(validation("invalid driver location"));
        }
        let at = update.timestamp.unwrap_or_else(Utc::now);
        let moved = {
            let mut state = self.inner.state.write().await;
            state.move_driver(driver_id, location, at)
        };
        if moved.is_some() {
            let record = DriverLocationRecord {
                driver_id: driver_id.to_string(),
                latitude: location.latitude,
                longitude: location.longitude,
                timestamp: at,
            };
            self.persist(
                "insert driver location",
                self.inner.store.insert_driver_location(&record).await,
            );
        }
        Ok(())
    }

    pub async fn set_driver_available(&self, driver_id: &str) -> Result<DriverView, DispatchError> {
        let driver = {
            let mut state = self.inner.state.write().await;
            state.mark_available(driver_id, Utc::now())?
        };
        let view = driver.view();
        self.persist("upsert driver", self.inner.store.upsert_driver(&view).await);
        Ok(view)
    }

    /// Takes the driver out of service, cancelling the ride it was on.
    pub async fn driver_offline(&self, driver_id: &str) -> Result<(), DispatchError> {
        let departure = {
            let mut state = self.inner.state.write().await;
            state.driver_departed(driver_id, Utc::now())
        }
        .ok_or_else(|| DispatchError::DriverNotFound(driver_id.to_string()))?;
        info!(driver_id, "driver offline");
        self.record_departure(&departure).await;
        Ok(())
    }

    /// Transport-level close. Stale sessions (identity already taken over)
    /// change nothing.
    pub async fn disconnect(&self, session: &Session) {
        let closed = {
            let mut state = self.inner.state.write().await;
            state.session_closed(&session.id, &session.tx, Utc::now())
        };
        match closed {
            Some(Disconnected::Driver(departure)) => {
                info!(driver_id = %departure.driver.driver_id, session = %session.id, "driver disconnected");
                self.record_departure(&departure).await;
            }
            Some(Disconnected::Passenger(passenger)) => {
                info!(passenger_id = %passenger.passenger_id, session = %session.id, "passenger disconnected");
            }
            None => {}
        }
    }

    async fn record_departure(&self, departure: &Departure) {
        if let Some(cancelled) = &departure.cancelled {
            self.record_cancellation(cancelled).await;
        }
        self.persist(
            "upsert driver",
            self.inner.store.upsert_driver(&departure.driver).await,
        );
        self.audit(
            departure.cancelled.as_ref().map(|c| c.ride.ride_id.as_str()),
            "driver",
            "driver:offline",
            serde_json::json!({ "driver_id": departure.driver.driver_id }),
        )
        .await;
    }

    fn persist(&self, what: &'static str, result: anyhow::Result<()>) {
        if let Err(err) = result {
            warn!(error = %err, what, "store write failed");
        }
    }

    async fn audit(&self, ride_id: Option<&str>, actor: &str, event_type: &str, payload: Value) {
        let event = AuditEvent {
            id: new_event_id(),
            ride_id: ride_id.map(str::to_string),
            actor: actor.to_string(),
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        self.persist("insert event", self.inner.store.insert_event(&event).await);
    }
}
