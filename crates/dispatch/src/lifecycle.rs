//! Ride state transitions over the shared engine state.
//!
//! Every method here runs under the engine's write guard and does no I/O:
//! it checks, mutates and queues notifications in one step. Routing and
//! persistence happen in the engine once the guard is gone.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::{debug, info};

use taxi_geo::Coordinate;
use taxi_protocol::{
    Confirmation, DriverConnected, DriverLocation, DriverOnline, DriverView, DriverWentOffline,
    NewRating, PassengerConnected, RatingSubmitted, RideAccepted, RideAcceptedConfirmation, RideCancelled,
    RideCompleted, RideCompletedConfirmation, RideDriverLocation, RideNotice, RideOffer,
    RideRequestSubmitted, RideRoomJoined, RideStarted, RideStatus, RideView, ServerEvent,
    StatusNotice,
};

use crate::error::DispatchError;
use crate::fanout::{EventSender, NotificationFanout};
use crate::fare::{format_money, CommissionSplit};
use crate::presence::{
    Candidate, Driver, DriverDescriptor, Participant, Passenger, PassengerDescriptor,
    PresenceRegistry,
};
use crate::ride::{Actor, PickupRoute, Ride, REASON_DRIVER_DISCONNECTED, REASON_NO_DRIVER};

/// Rough arrival estimate used for offers and nearby-driver answers.
pub const ARRIVAL_MINUTES_PER_KM: f64 = 2.0;

pub fn arrival_minutes(distance_km: f64) -> u32 {
    (distance_km * ARRIVAL_MINUTES_PER_KM).round().max(0.0) as u32
}

/// Live rides, terminal history and the pending timeout per ride.
#[derive(Debug, Default)]
pub struct RideBook {
    live: HashMap<String, Ride>,
    completed: HashMap<String, Ride>,
    cancelled: HashMap<String, Ride>,
    timers: HashMap<String, AbortHandle>,
}

impl RideBook {
    pub fn get(&self, ride_id: &str) -> Option<&Ride> {
        self.live
            .get(ride_id)
            .or_else(|| self.completed.get(ride_id))
            .or_else(|| self.cancelled.get(ride_id))
    }

    pub fn live(&self) -> impl Iterator<Item = &Ride> {
        self.live.values()
    }

    pub fn completed(&self) -> impl Iterator<Item = &Ride> {
        self.completed.values()
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &Ride> {
        self.cancelled.values()
    }

    pub fn is_live(&self, ride_id: &str) -> bool {
        self.live.contains_key(ride_id)
    }

    fn finished(&self, ride_id: &str) -> Option<&Ride> {
        self.completed
            .get(ride_id)
            .or_else(|| self.cancelled.get(ride_id))
    }

    fn find_mut(&mut self, ride_id: &str) -> Option<&mut Ride> {
        if let Some(ride) = self.live.get_mut(ride_id) {
            return Some(ride);
        }
        if let Some(ride) = self.completed.get_mut(ride_id) {
            return Some(ride);
        }
        self.cancelled.get_mut(ride_id)
    }

    /// Live ride for a transition, or the error a finished/unknown id maps to.
    fn live_for(&mut self, ride_id: &str, action: &'static str) -> Result<&mut Ride, DispatchError> {
        if let Some(ride) = self.finished(ride_id) {
            return Err(DispatchError::InvalidTransition {
                ride_id: ride_id.to_string(),
                action,
                status: ride.status,
            });
        }
        self.live
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))
    }

    /// Keeps exactly one timer per ride; an older handle is aborted.
    pub fn arm_timer(&mut self, ride_id: &str, handle: AbortHandle) {
        if let Some(previous) = self.timers.insert(ride_id.to_string(), handle) {
            previous.abort();
        }
    }

    pub fn defuse_timer(&mut self, ride_id: &str) -> bool {
        match self.timers.remove(ride_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Removes the handle without aborting it. Used by the timer task itself.
    pub fn take_timer(&mut self, ride_id: &str) -> Option<AbortHandle> {
        self.timers.remove(ride_id)
    }

    pub fn has_timer(&self, ride_id: &str) -> bool {
        self.timers.contains_key(ride_id)
    }

    /// Drops finished rides whose terminal timestamp is older than `cutoff`.
    pub fn sweep(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.completed.len() + self.cancelled.len();
        let keep = |ride: &Ride| ride.finished_at().map_or(true, |at| at >= cutoff);
        self.completed.retain(|_, ride| keep(ride));
        self.cancelled.retain(|_, ride| keep(ride));
        before - (self.completed.len() + self.cancelled.len())
    }

    fn finish(&mut self, ride_id: &str) {
        if let Some(ride) = self.live.remove(ride_id) {
            match ride.status {
                RideStatus::Completed => {
                    self.completed.insert(ride_id.to_string(), ride);
                }
                RideStatus::Cancelled => {
                    self.cancelled.insert(ride_id.to_string(), ride);
                }
                _ => {
                    self.live.insert(ride_id.to_string(), ride);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Acceptance {
    pub ride: RideView,
    pub driver: DriverView,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub ride: RideView,
    pub split: CommissionSplit,
    pub driver: Option<DriverView>,
}

#[derive(Debug, Clone)]
pub struct Cancellation {
    pub ride: RideView,
    pub actor: Actor,
    pub driver_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Rated {
    pub ride: RideView,
    pub driver_id: String,
    pub new_average: f64,
}

#[derive(Debug, Clone)]
pub struct Departure {
    pub driver: DriverView,
    pub cancelled: Option<Cancellation>,
}

#[derive(Debug, Clone)]
pub enum Disconnected {
    Driver(Departure),
    Passenger(Passenger),
}

/// Everything the engine guards with its single lock.
#[derive(Debug, Default)]
pub struct EngineState {
    pub presence: PresenceRegistry,
    pub rides: RideBook,
    pub fanout: NotificationFanout,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_driver(
        &mut self,
        descriptor: DriverDescriptor,
        session_id: &str,
        tx: EventSender,
        now: DateTime<Utc>,
    ) -> Result<Driver, DispatchError> {
        self.claim_session(session_id, &Participant::Driver(descriptor.driver_id.clone()))?;
        let driver = self.presence.register_driver(descriptor, session_id, now);
        let who = Participant::Driver(driver.driver_id.clone());
        self.fanout.attach(who.clone(), tx);
        self.fanout.send_to(
            &who,
            ServerEvent::DriverConnected(DriverConnected {
                status: "success".to_string(),
                message: "Driver connected successfully".to_string(),
                driver_id: driver.driver_id.clone(),
                timestamp: now,
            }),
        );
        self.fanout.broadcast(&ServerEvent::DriverOnline(DriverOnline {
            driver_id: driver.driver_id.clone(),
            name: driver.name.clone(),
            vehicle_type: driver.vehicle_type.clone(),
            latitude: driver.location.latitude,
            longitude: driver.location.longitude,
            rating: driver.rating,
            timestamp: now,
        }));
        Ok(driver)
    }

    pub fn connect_passenger(
        &mut self,
        descriptor: PassengerDescriptor,
        session_id: &str,
        tx: EventSender,
        now: DateTime<Utc>,
    ) -> Result<Passenger, DispatchError> {
        self.claim_session(
            session_id,
            &Participant::Passenger(descriptor.passenger_id.clone()),
        )?;
        let passenger = self.presence.register_passenger(descriptor, session_id, now);
        let who = Participant::Passenger(passenger.passenger_id.clone());
        self.fanout.attach(who.clone(), tx);
        self.fanout.send_to(
            &who,
            ServerEvent::PassengerConnected(PassengerConnected {
                status: "success".to_string(),
                passenger_id: passenger.passenger_id.clone(),
                timestamp: now,
            }),
        );
        Ok(passenger)
    }

    /// A session speaks for one participant for its whole life; reconnecting
    /// as the same one is fine.
    fn claim_session(&self, session_id: &str, wanted: &Participant) -> Result<(), DispatchError> {
        match self.presence.participant_for_session(session_id) {
            Some(bound) if bound != wanted => Err(DispatchError::NotAuthorized(format!(
                "session already connected as {}",
                bound.id()
            ))),
            _ => Ok(()),
        }
    }

    /// Transport close: departs whoever the session still speaks for, in the
    /// same step as the lookup so a reconnect cannot slip in between.
    pub fn session_closed(
        &mut self,
        session_id: &str,
        tx: &EventSender,
        now: DateTime<Utc>,
    ) -> Option<Disconnected> {
        match self.presence.participant_for_session(session_id)?.clone() {
            Participant::Driver(driver_id) => {
                self.driver_departed(&driver_id, now).map(Disconnected::Driver)
            }
            Participant::Passenger(passenger_id) => self
                .passenger_departed(&passenger_id, tx)
                .map(Disconnected::Passenger),
        }
    }

    /// A passenger session went away. Its rides stay where they are; the
    /// request timeout takes care of unanswered ones.
    pub fn passenger_departed(&mut self, passenger_id: &str, tx: &EventSender) -> Option<Passenger> {
        let who = Participant::Passenger(passenger_id.to_string());
        if !self.fanout.detach(&who, tx) {
            return None;
        }
        self.presence.remove_passenger(passenger_id)
    }

    /// Returns the driver after the move, or `None` for an unknown driver.
    pub fn move_driver(
        &mut self,
        driver_id: &str,
        location: Coordinate,
        at: DateTime<Utc>,
    ) -> Option<Driver> {
        let driver = self
            .presence
            .update_driver_location(driver_id, location, at)?
            .clone();
        self.fanout
            .broadcast(&ServerEvent::DriverLocationUpdate(DriverLocation {
                driver_id: driver.driver_id.clone(),
                name: driver.name.clone(),
                latitude: location.latitude,
                longitude: location.longitude,
                is_available: driver.is_available,
                timestamp: at,
            }));
        if let Some(ride_id) = &driver.current_ride {
            if let Some(ride) = self.rides.live.get_mut(ride_id) {
                ride.update_driver_location(location);
                self.fanout.send_to_ride(
                    ride_id,
                    ServerEvent::RideDriverLocation(RideDriverLocation {
                        ride_id: ride_id.clone(),
                        driver_id: driver.driver_id.clone(),
                        latitude: location.latitude,
                        longitude: location.longitude,
                        timestamp: at,
                    }),
                );
            }
        }
        Some(driver)
    }

    pub fn mark_available(&mut self, driver_id: &str, now: DateTime<Utc>) -> Result<Driver, DispatchError> {
        self.presence.set_availability(driver_id, true);
        let driver = self
            .presence
            .driver(driver_id)
            .cloned()
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.to_string()))?;
        let (status, message) = if driver.is_available {
            ("available", "You are now available for rides")
        } else {
            ("busy", "Finish your current ride first")
        };
        self.fanout.send_to_driver(
            driver_id,
            ServerEvent::DriverAvailableConfirmation(StatusNotice {
                status: status.to_string(),
                message: message.to_string(),
                timestamp: now,
            }),
        );
        Ok(driver)
    }

    pub fn create_ride(&mut self, ride: Ride) -> RideView {
        let view = ride.view();
        self.fanout.open_group(&ride.ride_id, &ride.passenger_id);
        self.rides.live.insert(ride.ride_id.clone(), ride);
        view
    }

    /// Confirms the request to the passenger and offers the ride to every
    /// candidate. Returns how many drivers were offered the ride.
    pub fn dispatch_ride(
        &mut self,
        ride_id: &str,
        radius_km: f64,
        now: DateTime<Utc>,
    ) -> Result<usize, DispatchError> {
        let ride = self
            .rides
            .live
            .get(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        let passenger_id = ride.passenger_id.clone();
        self.fanout.send_to_passenger(
            &passenger_id,
            ServerEvent::RideRequestSubmitted(RideRequestSubmitted {
                ride_id: ride_id.to_string(),
                status: RideStatus::Requested.to_string(),
                message: "Looking for nearby drivers".to_string(),
                estimated_fare: format_money(ride.fare),
                distance: ride.route.distance_text.clone(),
                duration: ride.route.duration_text.clone(),
                timestamp: now,
            }),
        );
        let offered = self.offer_ride(ride_id, radius_km)?;
        if offered == 0 {
            self.fanout.send_to_passenger(
                &passenger_id,
                ServerEvent::NoDriversAvailable(RideNotice {
                    ride_id: ride_id.to_string(),
                    message: "No drivers available in your area".to_string(),
                    timestamp: now,
                }),
            );
        }
        Ok(offered)
    }

    /// Offers a requested ride to available drivers in range that have not
    /// turned it down yet, nearest first.
    pub fn offer_ride(&self, ride_id: &str, radius_km: f64) -> Result<usize, DispatchError> {
        let ride = self
            .rides
            .live
            .get(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        if ride.status != RideStatus::Requested {
            return Ok(0);
        }
        let candidates: Vec<Candidate> = self
            .presence
            .find_available(ride.pickup, radius_km)
            .into_iter()
            .filter(|c| !ride.rejected_by.contains(&c.driver.driver_id))
            .collect();
        let view = ride.view();
        for candidate in &candidates {
            let offer = RideOffer {
                ride: view.clone(),
                estimated_arrival: format!("{} mins", arrival_minutes(candidate.distance_km)),
                driver_distance: format!("{:.2}", candidate.distance_km),
            };
            self.fanout
                .send_to_driver(&candidate.driver.driver_id, ServerEvent::RideRequest(offer));
        }
        debug!(ride_id, offered = candidates.len(), "ride offered");
        Ok(candidates.len())
    }

    /// Compare-and-set: the status guard, the driver assignment and the
    /// status write happen together, so of two racing drivers exactly one
    /// gets here.
    pub fn accept_ride(
        &mut self,
        ride_id: &str,
        driver_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Acceptance, DispatchError> {
        if self.rides.finished(ride_id).is_some() {
            return Err(DispatchError::RideNotPending(ride_id.to_string()));
        }
        let ride = self
            .rides
            .live
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        ride.check_acceptable()?;
        let driver = self.presence.assign_ride(driver_id, ride_id)?.clone();
        ride.accept(&driver, now)?;
        let view = ride.view();
        self.rides.defuse_timer(ride_id);
        self.fanout.join_driver(ride_id, driver_id);
        info!(ride_id, driver_id, "ride accepted");
        Ok(Acceptance {
            ride: view,
            driver: driver.view(),
        })
    }

    /// Stores the driver-to-pickup route and tells both parties about the
    /// acceptance. Skipped when the ride moved on while the route was being
    /// computed.
    pub fn announce_acceptance(
        &mut self,
        ride_id: &str,
        driver_id: &str,
        route: PickupRoute,
        now: DateTime<Utc>,
    ) -> Option<RideView> {
        let ride = self.rides.live.get_mut(ride_id)?;
        if ride.status != RideStatus::Accepted || !ride.is_assigned_to(driver_id) {
            return None;
        }
        ride.pickup_route = Some(route);
        let view = ride.view();
        let driver = ride.driver.clone()?;
        let pickup_route = ride.pickup_route.clone()?;

        self.fanout.send_to_passenger(
            &view.passenger_id,
            ServerEvent::RideAccepted(RideAccepted {
                ride_id: ride_id.to_string(),
                driver_id: driver.driver_id.clone(),
                driver_name: driver.name.clone(),
                driver_phone: driver.phone.clone(),
                driver_vehicle: driver.vehicle_type.clone(),
                driver_vehicle_number: driver.vehicle_number.clone(),
                driver_rating: driver.rating,
                driver_latitude: driver.location.latitude,
                driver_longitude: driver.location.longitude,
                estimated_arrival: pickup_route.duration_text.clone(),
                pickup_address: view.pickup_address.clone(),
                destination_address: view.destination_address.clone(),
                fare: view.fare.clone(),
                distance: view.distance_text.clone(),
                duration: view.duration_text.clone(),
                route_polyline: view.route_polyline.clone(),
                driver_to_pickup_polyline: pickup_route.polyline.clone(),
                driver_to_pickup_distance: Some(pickup_route.distance_text.clone()),
                driver_to_pickup_duration: Some(pickup_route.duration_text.clone()),
                timestamp: now,
            }),
        );
        self.fanout.send_to_driver(
            driver_id,
            ServerEvent::RideAcceptedConfirmation(RideAcceptedConfirmation {
                ride_id: ride_id.to_string(),
                status: RideStatus::Accepted.to_string(),
                message: "Ride accepted successfully".to_string(),
                passenger_name: view.passenger_name.clone(),
                passenger_phone: view.passenger_phone.clone(),
                pickup_address: view.pickup_address.clone(),
                destination_address: view.destination_address.clone(),
                fare: view.fare.clone(),
                distance: view.distance_text.clone(),
                duration: view.duration_text.clone(),
                timestamp: now,
            }),
        );
        let members = self.fanout.group(ride_id).map_or(0, |g| g.members().len());
        self.fanout.send_to_ride(
            ride_id,
            ServerEvent::RideRoomJoined(RideRoomJoined {
                ride_id: ride_id.to_string(),
                members,
            }),
        );
        Some(view)
    }

    /// Records the rejection and re-offers the ride to whoever is left. The
    /// rejecting driver always gets its confirmation; the ride timer is left
    /// alone.
    pub fn reject_ride(
        &mut self,
        ride_id: &str,
        driver_id: &str,
        radius_km: f64,
        now: DateTime<Utc>,
    ) -> usize {
        let mut reoffered = 0;
        if let Some(ride) = self.rides.live.get_mut(ride_id) {
            if ride.status == RideStatus::Requested {
                if !ride.rejected_by.iter().any(|id| id == driver_id) {
                    ride.rejected_by.push(driver_id.to_string());
                }
                reoffered = self.offer_ride(ride_id, radius_km).unwrap_or(0);
            }
        }
        self.fanout.send_to_driver(
            driver_id,
            ServerEvent::RideRejectedConfirmation(Confirmation {
                ride_id: ride_id.to_string(),
                status: "rejected".to_string(),
                message: "Ride rejected".to_string(),
                timestamp: now,
            }),
        );
        reoffered
    }

    pub fn start_ride(
        &mut self,
        ride_id: &str,
        driver_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RideView, DispatchError> {
        let ride = self.rides.live_for(ride_id, "start")?;
        ride.start(driver_id, now)?;
        let view = ride.view();
        let driver_name = ride.driver.as_ref().map(|d| d.name.clone()).unwrap_or_default();

        self.fanout.send_to_passenger(
            &view.passenger_id,
            ServerEvent::RideStarted(RideStarted {
                ride_id: ride_id.to_string(),
                driver_id: driver_id.to_string(),
                driver_name,
                started_at: now,
                estimated_duration: view.duration_text.clone(),
                destination_address: view.destination_address.clone(),
                timestamp: now,
            }),
        );
        self.fanout.send_to_driver(
            driver_id,
            ServerEvent::RideStartedConfirmation(Confirmation {
                ride_id: ride_id.to_string(),
                status: RideStatus::Started.to_string(),
                message: "Ride started".to_string(),
                timestamp: now,
            }),
        );
        info!(ride_id, driver_id, "ride started");
        Ok(view)
    }

    pub fn complete_ride(
        &mut self,
        ride_id: &str,
        driver_id: &str,
        actual_fare: Option<f64>,
        commission_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<Completion, DispatchError> {
        let ride = self.rides.live_for(ride_id, "complete")?;
        let split = ride.complete(driver_id, actual_fare, commission_rate, now)?;
        let view = ride.view();
        let driver_name = ride.driver.as_ref().map(|d| d.name.clone()).unwrap_or_default();
        self.rides.finish(ride_id);
        let totals = self.presence.record_completion(driver_id, ride_id, split.net);
        let driver = self.presence.driver(driver_id).map(Driver::view);

        self.fanout.send_to_passenger(
            &view.passenger_id,
            ServerEvent::RideCompleted(RideCompleted {
                ride_id: ride_id.to_string(),
                driver_id: driver_id.to_string(),
                driver_name,
                completed_at: now,
                fare: format_money(split.gross),
                distance: view.distance_text.clone(),
                duration: view.duration_text.clone(),
                rating_request: true,
                timestamp: now,
            }),
        );
        let (total_rides, total_earnings) = totals.unwrap_or_default();
        self.fanout.send_to_driver(
            driver_id,
            ServerEvent::RideCompletedConfirmation(RideCompletedConfirmation {
                ride_id: ride_id.to_string(),
                status: RideStatus::Completed.to_string(),
                message: "Ride completed".to_string(),
                fare: format_money(split.gross),
                commission: format_money(split.commission),
                total_earnings,
                total_rides,
                timestamp: now,
            }),
        );
        self.fanout.close_group(ride_id);
        info!(ride_id, driver_id, fare = split.gross, "ride completed");
        Ok(Completion {
            ride: view,
            split,
            driver,
        })
    }

    /// `Ok(None)` when the ride already finished.
    pub fn cancel_ride(
        &mut self,
        ride_id: &str,
        actor: Actor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Cancellation>, DispatchError> {
        if self.rides.finished(ride_id).is_some() {
            return Ok(None);
        }
        let cancellation = self.close_live_ride(ride_id, actor, reason, now)?;
        let event = ServerEvent::RideCancelled(RideCancelled {
            ride_id: ride_id.to_string(),
            reason: cancellation.ride.cancellation_reason.clone().unwrap_or_default(),
            cancelled_by: cancellation.actor.label().to_string(),
            timestamp: now,
        });
        let mut audience = vec![Participant::Passenger(cancellation.ride.passenger_id.clone())];
        if let Some(driver_id) = &cancellation.driver_id {
            audience.push(Participant::Driver(driver_id.clone()));
        }
        let acting = match &cancellation.actor {
            Actor::Passenger(id) => Some(Participant::Passenger(id.clone())),
            Actor::Driver(id) => Some(Participant::Driver(id.clone())),
            Actor::System => None,
        };
        for member in audience.iter().filter(|m| Some(*m) != acting.as_ref()) {
            self.fanout.send_to(member, event.clone());
        }
        if let Some(acting) = &acting {
            self.fanout.send_to(
                acting,
                ServerEvent::RideCancelledConfirmation(Confirmation {
                    ride_id: ride_id.to_string(),
                    status: RideStatus::Cancelled.to_string(),
                    message: "Ride cancelled".to_string(),
                    timestamp: now,
                }),
            );
        }
        Ok(Some(cancellation))
    }

    /// Timer expiry. Only a ride still in `requested` is cancelled; anything
    /// else means the timer lost a race with a transition and does nothing.
    pub fn expire_ride(&mut self, ride_id: &str, now: DateTime<Utc>) -> Option<Cancellation> {
        self.rides.take_timer(ride_id);
        let ride = self.rides.live.get(ride_id)?;
        if ride.status != RideStatus::Requested {
            return None;
        }
        let cancellation = self
            .close_live_ride(ride_id, Actor::System, Some(REASON_NO_DRIVER.to_string()), now)
            .ok()?;
        self.fanout.send_to_passenger(
            &cancellation.ride.passenger_id,
            ServerEvent::RideTimeout(RideNotice {
                ride_id: ride_id.to_string(),
                message: "No driver accepted your ride request".to_string(),
                timestamp: now,
            }),
        );
        Some(cancellation)
    }

    fn close_live_ride(
        &mut self,
        ride_id: &str,
        actor: Actor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Cancellation, DispatchError> {
        let ride = self
            .rides
            .live
            .get_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        let released = ride.cancel(&actor, reason, now)?;
        let view = ride.view();
        self.rides.defuse_timer(ride_id);
        self.rides.finish(ride_id);
        let driver_id = released.map(|d| d.driver_id);
        if let Some(driver_id) = &driver_id {
            self.presence.release_driver(driver_id, ride_id);
        }
        self.fanout.close_group(ride_id);
        info!(
            ride_id,
            actor = actor.label(),
            reason = view.cancellation_reason.as_deref().unwrap_or_default(),
            "ride cancelled"
        );
        Ok(Cancellation {
            ride: view,
            actor,
            driver_id,
        })
    }

    pub fn rate_ride(
        &mut self,
        ride_id: &str,
        passenger_id: &str,
        score: u8,
        feedback: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Rated, DispatchError> {
        let ride = self
            .rides
            .find_mut(ride_id)
            .ok_or_else(|| DispatchError::RideNotFound(ride_id.to_string()))?;
        let driver_id = ride.check_rating(passenger_id, score)?;
        // A driver that already left has no average to fold the score into.
        let new_average = self
            .presence
            .apply_rating(&driver_id, score)
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.clone()))?;
        ride.rate(passenger_id, score, feedback.clone())?;
        let view = ride.view();

        self.fanout.send_to_driver(
            &driver_id,
            ServerEvent::NewRating(NewRating {
                ride_id: ride_id.to_string(),
                rating: score,
                feedback: feedback.unwrap_or_default(),
                new_average_rating: new_average,
                timestamp: now,
            }),
        );
        self.fanout.send_to_passenger(
            passenger_id,
            ServerEvent::RatingSubmitted(RatingSubmitted {
                ride_id: ride_id.to_string(),
                rating: score,
                message: "Thank you for your feedback".to_string(),
                timestamp: now,
            }),
        );
        Ok(Rated {
            ride: view,
            driver_id,
            new_average,
        })
    }

    /// Explicit offline or a dropped session: the driver goes offline, its
    /// ride (if any) is cancelled, and it leaves the registry.
    pub fn driver_departed(&mut self, driver_id: &str, now: DateTime<Utc>) -> Option<Departure> {
        let current_ride = self.presence.mark_offline(driver_id)?;
        let cancelled = match current_ride {
            Some(ride_id) => self
                .cancel_ride(
                    &ride_id,
                    Actor::Driver(driver_id.to_string()),
                    Some(REASON_DRIVER_DISCONNECTED.to_string()),
                    now,
                )
                .ok()
                .flatten(),
            None => None,
        };
        let driver = self.presence.remove_driver(driver_id)?;
        self.fanout.remove(&Participant::Driver(driver_id.to_string()));
        self.fanout
            .broadcast(&ServerEvent::DriverOffline(DriverWentOffline {
                driver_id: driver_id.to_string(),
                timestamp: now,
            }));
        Some(Departure {
            driver: driver.view(),
            cancelled,
        })
    }
}
