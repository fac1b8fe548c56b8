#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use taxi_dispatch::{DispatchEngine, EngineSettings, Session};
use taxi_geo::{fallback_estimate, Coordinate, GeoError, GeoEstimator, Route, RouteLeg, RoutingProvider};
use taxi_protocol::{ConnectDriver, ConnectPassenger, RideRequest, ServerEvent};
use taxi_store::mock::MemoryStore;

/// Deterministic provider: straight-line legs and a fixed polyline.
pub struct FakeRouting;

#[async_trait]
impl RoutingProvider for FakeRouting {
    async fn distance_matrix(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RouteLeg, GeoError> {
        Ok(fallback_estimate(origin, destination))
    }

    async fn directions(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Option<Route>, GeoError> {
        Ok(Some(Route {
            polyline: "fake_polyline".to_string(),
            leg: fallback_estimate(origin, destination),
            steps: Vec::new(),
        }))
    }
}

/// Straight-line provider whose `directions` call can be held open once
/// armed, so a test can interleave work while a route is in flight.
#[derive(Default)]
pub struct GatedRouting {
    armed: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedRouting {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RoutingProvider for GatedRouting {
    async fn distance_matrix(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RouteLeg, GeoError> {
        Ok(fallback_estimate(origin, destination))
    }

    async fn directions(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Option<Route>, GeoError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(Some(Route {
            polyline: "gated_polyline".to_string(),
            leg: fallback_estimate(origin, destination),
            steps: Vec::new(),
        }))
    }
}

pub struct Harness {
    pub engine: DispatchEngine,
    pub store: MemoryStore,
}

pub fn harness() -> Harness {
    harness_with(EngineSettings::default())
}

pub fn harness_with(settings: EngineSettings) -> Harness {
    harness_with_routing(settings, Arc::new(FakeRouting))
}

pub fn harness_with_routing(settings: EngineSettings, routing: Arc<dyn RoutingProvider>) -> Harness {
    let store = MemoryStore::new();
    let engine = DispatchEngine::new(
        settings,
        GeoEstimator::new(routing),
        Arc::new(store.clone()),
    );
    Harness { engine, store }
}

/// A connected session and the events delivered to it.
pub struct Client {
    pub session: Session,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl Client {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            session: Session::new(tx),
            rx,
        }
    }

    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn drain_types(&mut self) -> Vec<String> {
        self.drain().iter().map(event_type).collect()
    }
}

pub fn event_type(event: &ServerEvent) -> String {
    event
        .to_envelope("test", 0)
        .expect("server event envelope")
        .message_type
}

pub async fn connect_driver(h: &Harness, driver_id: &str, latitude: f64, longitude: f64) -> Client {
    let client = Client::new();
    h.engine
        .connect_driver(&client.session, driver_payload(driver_id, latitude, longitude))
        .await
        .expect("driver connects");
    client
}

pub fn driver_payload(driver_id: &str, latitude: f64, longitude: f64) -> ConnectDriver {
    ConnectDriver {
        driver_id: driver_id.to_string(),
        name: Some(format!("Driver {driver_id}")),
        phone: Some("555-0100".to_string()),
        vehicle_type: Some("Sedan".to_string()),
        vehicle_number: Some("ABC-123".to_string()),
        rating: None,
        latitude,
        longitude,
        total_rides: None,
        total_earnings: None,
    }
}

pub async fn connect_passenger(h: &Harness, passenger_id: &str) -> Client {
    let client = Client::new();
    h.engine
        .connect_passenger(
            &client.session,
            ConnectPassenger {
                passenger_id: passenger_id.to_string(),
                name: Some(format!("Passenger {passenger_id}")),
                phone: Some("555-0199".to_string()),
            },
        )
        .await
        .expect("passenger connects");
    client
}

pub fn ride_request(pickup: (f64, f64), destination: (f64, f64)) -> RideRequest {
    RideRequest {
        pickup_latitude: Some(pickup.0),
        pickup_longitude: Some(pickup.1),
        pickup_address: Some("Pickup Plaza".to_string()),
        destination_latitude: Some(destination.0),
        destination_longitude: Some(destination.1),
        destination_address: Some("Harbour Street".to_string()),
        ..Default::default()
    }
}
