//! Read-only views over engine state, plus the periodic history sweep.

use chrono::{DateTime, Utc};

use taxi_geo::Coordinate;
use taxi_protocol::{DriverView, NearbyDriver, NearbyDrivers, PassengerView, RideHistory, RideView};
use taxi_store::{AuditEvent, EventFilter};

use super::{DispatchEngine, EngineStats};
use crate::error::{validation, DispatchError};
use crate::lifecycle::arrival_minutes;
use crate::presence::{Driver, Passenger};
use crate::ride::Ride;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

fn newest_first(mut rides: Vec<RideView>) -> Vec<RideView> {
    rides.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
    rides
}

impl DispatchEngine {
    pub async fn drivers(&self) -> Vec<DriverView> {
        let state = self.inner.state.read().await;
        let mut drivers: Vec<DriverView> = state.presence.drivers().map(Driver::view).collect();
        drivers.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        drivers
    }

    pub async fn passengers(&self) -> Vec<PassengerView> {
        let state = self.inner.state.read().await;
        let mut passengers: Vec<PassengerView> =
            state.presence.passengers().map(Passenger::view).collect();
        passengers.sort_by(|a, b| a.passenger_id.cmp(&b.passenger_id));
        passengers
    }

    pub async fn driver(&self, driver_id: &str) -> Option<DriverView> {
        let state = self.inner.state.read().await;
        state.presence.driver(driver_id).map(Driver::view)
    }

    pub async fn passenger(&self, passenger_id: &str) -> Option<PassengerView> {
        let state = self.inner.state.read().await;
        state.presence.passenger(passenger_id).map(Passenger::view)
    }

    /// Looks in live rides first, then finished history.
    pub async fn ride(&self, ride_id: &str) -> Option<RideView> {
        let state = self.inner.state.read().await;
        state.rides.get(ride_id).map(Ride::view)
    }

    pub async fn live_rides(&self) -> Vec<RideView> {
        let state = self.inner.state.read().await;
        newest_first(state.rides.live().map(Ride::view).collect())
    }

    pub async fn completed_rides(&self) -> Vec<RideView> {
        let state = self.inner.state.read().await;
        newest_first(state.rides.completed().map(Ride::view).collect())
    }

    pub async fn cancelled_rides(&self) -> Vec<RideView> {
        let state = self.inner.state.read().await;
        newest_first(state.rides.cancelled().map(Ride::view).collect())
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.state.read().await;
        EngineStats {
            drivers_online: state.presence.drivers().filter(|d| d.is_online).count(),
            drivers_available: state.presence.drivers().filter(|d| d.is_available).count(),
            passengers: state.presence.passengers().count(),
            live_rides: state.rides.live().count(),
            completed_rides: state.rides.completed().count(),
            cancelled_rides: state.rides.cancelled().count(),
            connected_clients: state.fanout.connected(),
        }
    }

    /// Available drivers around a point, nearest first, with the 2 min/km
    /// arrival estimate. `radius` defaults to the dispatch radius.
    pub async fn nearby_drivers(
        &self,
        latitude: f64,
        longitude: f64,
        radius: Option<f64>,
    ) -> Result<NearbyDrivers, DispatchError> {
        let origin = Coordinate::new(latitude, longitude);
        if !origin.is_valid() {
            return Err(validation("invalid coordinate"));
        }
        let radius = radius.unwrap_or(self.inner.settings.radius_km);
        if !radius.is_finite() || radius <= 0.0 {
            return Err(validation("radius must be positive"));
        }
        let state = self.inner.state.read().await;
        let drivers: Vec<NearbyDriver> = state
            .presence
            .find_available(origin, radius)
            .into_iter()
            .map(|candidate| NearbyDriver {
                driver_id: candidate.driver.driver_id,
                name: candidate.driver.name,
                phone: candidate.driver.phone,
                vehicle_type: candidate.driver.vehicle_type,
                vehicle_number: candidate.driver.vehicle_number,
                rating: candidate.driver.rating,
                distance: (candidate.distance_km * 100.0).round() / 100.0,
                estimated_arrival: arrival_minutes(candidate.distance_km),
            })
            .collect();
        Ok(NearbyDrivers {
            latitude,
            longitude,
            radius,
            count: drivers.len(),
            drivers,
            timestamp: Utc::now(),
        })
    }

    /// The passenger's completed rides, most recent first.
    pub async fn ride_history(&self, passenger_id: &str, limit: Option<usize>) -> RideHistory {
        let state = self.inner.state.read().await;
        let mut rides: Vec<&Ride> = state
            .rides
            .completed()
            .filter(|ride| ride.passenger_id == passenger_id)
            .collect();
        rides.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        let rides: Vec<RideView> = rides
            .into_iter()
            .take(limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
            .map(Ride::view)
            .collect();
        RideHistory {
            passenger_id: passenger_id.to_string(),
            total_rides: rides.len(),
            rides,
            timestamp: Utc::now(),
        }
    }

    pub async fn recent_events(&self, filter: &EventFilter) -> anyhow::Result<Vec<AuditEvent>> {
        self.inner.store.recent_events(filter).await
    }

    /// Evicts finished rides older than the retention window.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.inner.settings.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        self.inner.state.write().await.rides.sweep(now - retention)
    }
}
