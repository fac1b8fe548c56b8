use chrono::Utc;
use tokio::task::AbortHandle;
use tracing::info;

use taxi_common::ids::new_ride_id;
use taxi_geo::Coordinate;
use taxi_protocol::{ChatRelay, RideRequest, RideStatus, RideView, ServerEvent};
use taxi_store::EarningsRecord;

use super::DispatchEngine;
use crate::error::{validation, DispatchError};
use crate::fare::parse_money;
use crate::lifecycle::Cancellation;
use crate::presence::{Driver, Participant};
use crate::ride::{Actor, PickupRoute, Ride, RideDraft};

impl DispatchEngine {
    /// Validates, prices and records a new ride, then dispatches it.
    pub async fn request_ride(
        &self,
        passenger_id: &str,
        request: RideRequest,
    ) -> Result<RideView, DispatchError> {
        let passenger = {
            let state = self.inner.state.read().await;
            state.presence.passenger(passenger_id).cloned()
        }
        .ok_or_else(|| DispatchError::PassengerNotFound(passenger_id.to_string()))?;
        let draft = RideDraft::from_request(&passenger, request)?;

        let geo = &self.inner.geo;
        let (leg, path) = tokio::join!(
            geo.distance_and_duration(draft.pickup, draft.destination),
            geo.route_polyline(draft.pickup, draft.destination),
        );
        let fare = draft
            .quoted_fare
            .unwrap_or_else(|| self.inner.settings.fares.fare(leg.distance_km, leg.duration_min));
        let now = Utc::now();
        let ride = Ride::create(draft, new_ride_id(now), leg, path, fare, now);
        let view = self.inner.state.write().await.create_ride(ride);
        info!(ride_id = %view.ride_id, passenger_id, fare = %view.fare, "ride requested");

        self.persist("insert ride", self.inner.store.insert_ride(&view).await);
        self.audit(
            Some(&view.ride_id),
            "passenger",
            "ride:requested",
            serde_json::json!({
                "passenger_id": passenger_id,
                "fare": view.fare,
                "distance": view.distance,
            }),
        )
        .await;

        self.dispatch(&view.ride_id).await?;
        Ok(view)
    }

    /// Offers the ride to nearby drivers and arms its timeout. Returns the
    /// number of drivers offered.
    pub async fn dispatch(&self, ride_id: &str) -> Result<usize, DispatchError> {
        let mut state = self.inner.state.write().await;
        let offered = state.dispatch_ride(ride_id, self.inner.settings.radius_km, Utc::now())?;
        let pending = state
            .rides
            .get(ride_id)
            .is_some_and(|ride| ride.status == RideStatus::Requested);
        if pending && !state.rides.has_timer(ride_id) {
            let handle = self.spawn_timeout(ride_id);
            state.rides.arm_timer(ride_id, handle);
        }
        if offered == 0 {
            info!(ride_id, "no drivers available");
        }
        Ok(offered)
    }

    fn spawn_timeout(&self, ride_id: &str) -> AbortHandle {
        let engine = self.clone();
        let ride_id = ride_id.to_string();
        let delay = self.inner.settings.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.timeout(&ride_id).await;
        })
        .abort_handle()
    }

    /// Fired by the ride's timer. A no-op unless the ride is still waiting.
    pub async fn timeout(&self, ride_id: &str) -> Option<RideView> {
        let expired = self.inner.state.write().await.expire_ride(ride_id, Utc::now())?;
        info!(ride_id, "ride timed out");
        self.persist(
            "update ride status",
            self.inner.store.update_ride_status(&expired.ride).await,
        );
        self.audit(
            Some(ride_id),
            "system",
            "ride:timeout",
            serde_json::json!({ "reason": expired.ride.cancellation_reason }),
        )
        .await;
        Some(expired.ride)
    }

    pub async fn accept(&self, ride_id: &str, driver_id: &str) -> Result<RideView, DispatchError> {
        let acceptance = self
            .inner
            .state
            .write()
            .await
            .accept_ride(ride_id, driver_id, Utc::now())?;

        let driver_at = Coordinate::new(acceptance.driver.latitude, acceptance.driver.longitude);
        let pickup = Coordinate::new(
            acceptance.ride.pickup_latitude,
            acceptance.ride.pickup_longitude,
        );
        let geo = &self.inner.geo;
        let (leg, path) = tokio::join!(
            geo.distance_and_duration(driver_at, pickup),
            geo.route_polyline(driver_at, pickup),
        );
        let route = PickupRoute {
            polyline: path.map(|p| p.polyline),
            distance_text: leg.distance_text,
            duration_text: leg.duration_text,
        };
        // The ride may have been cancelled while the route was computed; the
        // snapshots written below must come from the same guard.
        let (view, driver) = {
            let mut state = self.inner.state.write().await;
            let view = state
                .announce_acceptance(ride_id, driver_id, route, Utc::now())
                .ok_or_else(|| DispatchError::RideNotPending(ride_id.to_string()))?;
            let driver = state.presence.driver(driver_id).map(Driver::view);
            (view, driver)
        };

        self.persist(
            "update ride status",
            self.inner.store.update_ride_status(&view).await,
        );
        if let Some(driver) = &driver {
            self.persist("upsert driver", self.inner.store.upsert_driver(driver).await);
        }
        self.audit(
            Some(ride_id),
            "driver",
            "ride:accepted",
            serde_json::json!({ "driver_id": driver_id }),
        )
        .await;
        Ok(view)
    }

    /// Always succeeds for the rejecting driver; returns how many drivers the
    /// ride was re-offered to.
    pub async fn reject(&self, ride_id: &str, driver_id: &str) -> usize {
        let reoffered = self.inner.state.write().await.reject_ride(
            ride_id,
            driver_id,
            self.inner.settings.radius_km,
            Utc::now(),
        );
        info!(ride_id, driver_id, reoffered, "ride rejected");
        reoffered
    }

    pub async fn start(&self, ride_id: &str, driver_id: &str) -> Result<RideView, DispatchError> {
        let view = self
            .inner
            .state
            .write()
            .await
            .start_ride(ride_id, driver_id, Utc::now())?;
        self.persist(
            "update ride status",
            self.inner.store.update_ride_status(&view).await,
        );
        self.audit(
            Some(ride_id),
            "driver",
            "ride:started",
            serde_json::json!({ "driver_id": driver_id }),
        )
        .await;
        Ok(view)
    }

    pub async fn complete(
        &self,
        ride_id: &str,
        driver_id: &str,
        fare: Option<&str>,
    ) -> Result<RideView, DispatchError> {
        let actual_fare = fare.map(parse_money).transpose()?;
        let completion = self.inner.state.write().await.complete_ride(
            ride_id,
            driver_id,
            actual_fare,
            self.inner.settings.commission_rate,
            Utc::now(),
        )?;

        let store = &self.inner.store;
        self.persist(
            "update ride status",
            store.update_ride_status(&completion.ride).await,
        );
        let earnings = EarningsRecord {
            driver_id: driver_id.to_string(),
            ride_id: ride_id.to_string(),
            amount: completion.split.gross,
            commission: completion.split.commission,
            net_amount: completion.split.net,
            payment_status: "pending".to_string(),
        };
        self.persist("insert earnings", store.insert_earnings(&earnings).await);
        if let Some(driver) = &completion.driver {
            self.persist("upsert driver", store.upsert_driver(driver).await);
        }
        self.audit(
            Some(ride_id),
            "driver",
            "ride:completed",
            serde_json::json!({
                "driver_id": driver_id,
                "fare": completion.split.gross,
                "commission": completion.split.commission,
            }),
        )
        .await;
        Ok(completion.ride)
    }

    /// `Ok(None)` when the ride had already finished.
    pub async fn cancel(
        &self,
        ride_id: &str,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Option<RideView>, DispatchError> {
        let cancelled = self
            .inner
            .state
            .write()
            .await
            .cancel_ride(ride_id, actor, reason, Utc::now())?;
        match cancelled {
            Some(cancelled) => {
                self.record_cancellation(&cancelled).await;
                Ok(Some(cancelled.ride))
            }
            None => Ok(None),
        }
    }

    pub(super) async fn record_cancellation(&self, cancelled: &Cancellation) {
        let store = &self.inner.store;
        self.persist(
            "update ride status",
            store.update_ride_status(&cancelled.ride).await,
        );
        if let Some(driver_id) = &cancelled.driver_id {
            let driver = self.driver(driver_id).await;
            if let Some(driver) = driver {
                self.persist("upsert driver", store.upsert_driver(&driver).await);
            }
        }
        self.audit(
            Some(&cancelled.ride.ride_id),
            cancelled.actor.label(),
            "ride:cancelled",
            serde_json::json!({ "reason": cancelled.ride.cancellation_reason }),
        )
        .await;
    }

    pub async fn rate(
        &self,
        ride_id: &str,
        passenger_id: &str,
        score: u8,
        feedback: Option<String>,
    ) -> Result<RideView, DispatchError> {
        let rated = self.inner.state.write().await.rate_ride(
            ride_id,
            passenger_id,
            score,
            feedback,
            Utc::now(),
        )?;
        info!(ride_id, driver_id = %rated.driver_id, score, "ride rated");

        self.persist(
            "update ride status",
            self.inner.store.update_ride_status(&rated.ride).await,
        );
        if let Some(driver) = self.driver(&rated.driver_id).await {
            self.persist("upsert driver", self.inner.store.upsert_driver(&driver).await);
        }
        self.audit(
            Some(ride_id),
            "passenger",
            "ride:rated",
            serde_json::json!({ "rating": score, "new_average": rated.new_average }),
        )
        .await;
        Ok(rated.ride)
    }

    /// Relays a chat line to the ride's group. Only members may speak.
    pub async fn chat(
        &self,
        ride_id: &str,
        sender: Participant,
        message_text: String,
    ) -> Result<usize, DispatchError> {
        if message_text.trim().is_empty() {
            return Err(validation("message_text must not be empty"));
        }
        let state = self.inner.state.read().await;
        if !state.rides.is_live(ride_id) {
            return Err(DispatchError::RideNotFound(ride_id.to_string()));
        }
        let member = state
            .fanout
            .group(ride_id)
            .is_some_and(|group| group.contains(&sender));
        if !member {
            return Err(DispatchError::NotAuthorized(format!(
                "{} is not part of ride {ride_id}",
                sender.id()
            )));
        }
        let relay = ChatRelay {
            ride_id: ride_id.to_string(),
            sender_id: sender.id().to_string(),
            message_text,
            timestamp: Utc::now(),
        };
        let event = match sender {
            Participant::Driver(_) => ServerEvent::DriverMessage(relay),
            Participant::Passenger(_) => ServerEvent::PassengerMessage(relay),
        };
        Ok(state.fanout.send_to_ride(ride_id, event))
    }
}
