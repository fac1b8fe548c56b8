use chrono::{DateTime, Utc};

use taxi_geo::{Coordinate, Route, RouteLeg};
use taxi_protocol::{RideRequest, RideStatus, RideView};

use crate::error::{validation, DispatchError};
use crate::fare::{format_money, parse_money, CommissionSplit};
use crate::presence::{Driver, Passenger};

pub const REASON_NO_DRIVER: &str = "no driver accepted";
pub const REASON_DRIVER_DISCONNECTED: &str = "driver disconnected";

/// Who asked for a transition. Drivers and passengers carry their id so the
/// ride can check ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    Passenger(String),
    Driver(String),
    System,
}

impl Actor {
    pub fn label(&self) -> &'static str {
        match self {
            Actor::Passenger(_) => "passenger",
            Actor::Driver(_) => "driver",
            Actor::System => "system",
        }
    }

    fn default_cancel_reason(&self) -> &'static str {
        match self {
            Actor::Passenger(_) => "cancelled by passenger",
            Actor::Driver(_) => "cancelled by driver",
            Actor::System => "cancelled by system",
        }
    }
}

/// A validated ride request, not yet priced.
#[derive(Debug, Clone, PartialEq)]
pub struct RideDraft {
    pub passenger_id: String,
    pub passenger_name: String,
    pub passenger_phone: String,
    pub pickup: Coordinate,
    pub pickup_address: String,
    pub destination: Coordinate,
    pub destination_address: String,
    pub notes: Option<String>,
    pub quoted_fare: Option<f64>,
}

impl RideDraft {
    /// Rejects missing or malformed fields. Name and phone fall back to the
    /// passenger's profile.
    pub fn from_request(passenger: &Passenger, request: RideRequest) -> Result<Self, DispatchError> {
        if passenger.passenger_id.trim().is_empty() {
            return Err(validation("missing required field: passenger_id"));
        }
        let pickup = coordinate(
            request.pickup_latitude,
            request.pickup_longitude,
            "pickup_latitude",
            "pickup_longitude",
        )?;
        let destination = coordinate(
            request.destination_latitude,
            request.destination_longitude,
            "destination_latitude",
            "destination_longitude",
        )?;
        let pickup_address = required_text(request.pickup_address, "pickup_address")?;
        let destination_address =
            required_text(request.destination_address, "destination_address")?;
        let quoted_fare = request.fare.as_deref().map(parse_money).transpose()?;

        Ok(Self {
            passenger_id: passenger.passenger_id.clone(),
            passenger_name: request
                .passenger_name
                .or_else(|| passenger.name.clone())
                .unwrap_or_default(),
            passenger_phone: request
                .passenger_phone
                .or_else(|| passenger.phone.clone())
                .unwrap_or_default(),
            pickup,
            pickup_address,
            destination,
            destination_address,
            notes: request.notes.filter(|n| !n.trim().is_empty()),
            quoted_fare,
        })
    }
}

fn coordinate(
    latitude: Option<f64>,
    longitude: Option<f64>,
    lat_field: &str,
    lng_field: &str,
) -> Result<Coordinate, DispatchError> {
    let latitude = latitude.ok_or_else(|| validation(format!("missing required field: {lat_field}")))?;
    let longitude =
        longitude.ok_or_else(|| validation(format!("missing required field: {lng_field}")))?;
    let coord = Coordinate::new(latitude, longitude);
    if !coord.is_valid() {
        return Err(validation(format!("invalid coordinate {lat_field}/{lng_field}")));
    }
    Ok(coord)
}

fn required_text(value: Option<String>, field: &str) -> Result<String, DispatchError> {
    match value {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(validation(format!("missing required field: {field}"))),
    }
}

/// Driver details copied onto the ride at acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedDriver {
    pub driver_id: String,
    pub name: String,
    pub phone: String,
    pub vehicle_type: String,
    pub vehicle_number: String,
    pub rating: f64,
    pub location: Coordinate,
}

impl From<&Driver> for AssignedDriver {
    fn from(driver: &Driver) -> Self {
        Self {
            driver_id: driver.driver_id.clone(),
            name: driver.name.clone(),
            phone: driver.phone.clone(),
            vehicle_type: driver.vehicle_type.clone(),
            vehicle_number: driver.vehicle_number.clone(),
            rating: driver.rating,
            location: driver.location,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PickupRoute {
    pub polyline: Option<String>,
    pub distance_text: String,
    pub duration_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ride {
    pub ride_id: String,
    pub passenger_id: String,
    pub passenger_name: String,
    pub passenger_phone: String,
    pub pickup: Coordinate,
    pub pickup_address: String,
    pub destination: Coordinate,
    pub destination_address: String,
    pub notes: Option<String>,
    pub route: RouteLeg,
    pub route_polyline: Option<String>,
    pub fare: f64,
    pub actual_fare: Option<f64>,
    pub commission: Option<f64>,
    pub status: RideStatus,
    pub driver: Option<AssignedDriver>,
    pub pickup_route: Option<PickupRoute>,
    /// Drivers that turned the offer down; never offered again.
    pub rejected_by: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
}

impl Ride {
    pub fn create(
        draft: RideDraft,
        ride_id: String,
        route: RouteLeg,
        path: Option<Route>,
        fare: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ride_id,
            passenger_id: draft.passenger_id,
            passenger_name: draft.passenger_name,
            passenger_phone: draft.passenger_phone,
            pickup: draft.pickup,
            pickup_address: draft.pickup_address,
            destination: draft.destination,
            destination_address: draft.destination_address,
            notes: draft.notes,
            route,
            route_polyline: path.map(|p| p.polyline),
            fare,
            actual_fare: None,
            commission: None,
            status: RideStatus::Requested,
            driver: None,
            pickup_route: None,
            rejected_by: Vec::new(),
            requested_at: now,
            accepted_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            cancelled_by: None,
            rating: None,
            feedback: None,
        }
    }

    pub fn driver_id(&self) -> Option<&str> {
        self.driver.as_ref().map(|d| d.driver_id.as_str())
    }

    pub fn is_assigned_to(&self, driver_id: &str) -> bool {
        self.driver_id() == Some(driver_id)
    }

    /// When the ride reached `completed` or `cancelled`.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.cancelled_at)
    }

    /// The guard half of acceptance; callers run it before touching the
    /// driver so a losing accept mutates nothing.
    pub fn check_acceptable(&self) -> Result<(), DispatchError> {
        match self.status {
            RideStatus::Requested => Ok(()),
            RideStatus::Accepted | RideStatus::Started => {
                Err(DispatchError::RideAlreadyProcessed(self.ride_id.clone()))
            }
            RideStatus::Completed | RideStatus::Cancelled => {
                Err(DispatchError::RideNotPending(self.ride_id.clone()))
            }
        }
    }

    pub fn accept(&mut self, driver: &Driver, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.check_acceptable()?;
        self.driver = Some(AssignedDriver::from(driver));
        self.status = RideStatus::Accepted;
        self.accepted_at = Some(now);
        Ok(())
    }

    pub fn start(&mut self, driver_id: &str, now: DateTime<Utc>) -> Result<(), DispatchError> {
        self.expect_status(RideStatus::Accepted, "start")?;
        self.expect_driver(driver_id)?;
        self.status = RideStatus::Started;
        self.started_at = Some(now);
        Ok(())
    }

    /// Falls back to the quoted fare when no actual fare is given.
    pub fn complete(
        &mut self,
        driver_id: &str,
        actual_fare: Option<f64>,
        commission_rate: f64,
        now: DateTime<Utc>,
    ) -> Result<CommissionSplit, DispatchError> {
        self.expect_status(RideStatus::Started, "complete")?;
        self.expect_driver(driver_id)?;
        let split = CommissionSplit::new(actual_fare.unwrap_or(self.fare), commission_rate);
        self.status = RideStatus::Completed;
        self.completed_at = Some(now);
        self.actual_fare = Some(split.gross);
        self.commission = Some(split.commission);
        Ok(split)
    }

    /// Cancels a live ride and hands back the driver it was assigned to.
    /// The ride keeps no driver reference afterwards.
    pub fn cancel(
        &mut self,
        actor: &Actor,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<AssignedDriver>, DispatchError> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        match actor {
            Actor::Passenger(id) if id != &self.passenger_id => {
                return Err(DispatchError::NotAuthorized(format!(
                    "ride {} belongs to another passenger",
                    self.ride_id
                )));
            }
            Actor::Driver(id) if !self.is_assigned_to(id) => {
                return Err(DispatchError::NotAuthorized(format!(
                    "ride {} is not assigned to driver {id}",
                    self.ride_id
                )));
            }
            _ => {}
        }
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| actor.default_cancel_reason().to_string());
        self.status = RideStatus::Cancelled;
        self.cancelled_at = Some(now);
        self.cancellation_reason = Some(reason);
        self.cancelled_by = Some(actor.label().to_string());
        Ok(self.driver.take())
    }

    /// Checks a rating without recording it. Returns the rated driver's id.
    pub fn check_rating(&self, passenger_id: &str, score: u8) -> Result<String, DispatchError> {
        if !(1..=5).contains(&score) {
            return Err(validation("rating must be between 1 and 5"));
        }
        if self.passenger_id != passenger_id {
            return Err(DispatchError::NotAuthorized(format!(
                "ride {} belongs to another passenger",
                self.ride_id
            )));
        }
        self.expect_status(RideStatus::Completed, "rate")?;
        if self.rating.is_some() {
            return Err(self.invalid("rate"));
        }
        self.driver_id()
            .map(str::to_string)
            .ok_or_else(|| self.invalid("rate"))
    }

    /// Returns the rated driver's id.
    pub fn rate(
        &mut self,
        passenger_id: &str,
        score: u8,
        feedback: Option<String>,
    ) -> Result<String, DispatchError> {
        let driver_id = self.check_rating(passenger_id, score)?;
        self.rating = Some(score);
        self.feedback = feedback;
        Ok(driver_id)
    }

    pub fn update_driver_location(&mut self, location: Coordinate) {
        if let Some(driver) = self.driver.as_mut() {
            driver.location = location;
        }
    }

    fn expect_status(&self, status: RideStatus, action: &'static str) -> Result<(), DispatchError> {
        if self.status == status {
            Ok(())
        } else {
            Err(self.invalid(action))
        }
    }

    fn expect_driver(&self, driver_id: &str) -> Result<(), DispatchError> {
        if self.is_assigned_to(driver_id) {
            Ok(())
        } else {
            Err(DispatchError::NotAuthorized(format!(
                "ride {} is not assigned to driver {driver_id}",
                self.ride_id
            )))
        }
    }

    fn invalid(&self, action: &'static str) -> DispatchError {
        DispatchError::InvalidTransition {
            ride_id: self.ride_id.clone(),
            action,
            status: self.status,
        }
    }

    pub fn view(&self) -> RideView {
        let driver = self.driver.as_ref();
        let pickup_route = self.pickup_route.as_ref();
        RideView {
            ride_id: self.ride_id.clone(),
            passenger_id: self.passenger_id.clone(),
            passenger_name: self.passenger_name.clone(),
            passenger_phone: self.passenger_phone.clone(),
            pickup_latitude: self.pickup.latitude,
            pickup_longitude: self.pickup.longitude,
            pickup_address: self.pickup_address.clone(),
            destination_latitude: self.destination.latitude,
            destination_longitude: self.destination.longitude,
            destination_address: self.destination_address.clone(),
            distance: format!("{:.2}", self.route.distance_km),
            distance_text: self.route.distance_text.clone(),
            duration: self.route.duration_min.round().max(0.0) as u32,
            duration_text: self.route.duration_text.clone(),
            fare: format_money(self.fare),
            actual_fare: self.actual_fare.map(format_money),
            commission: self.commission.map(format_money),
            route_polyline: self.route_polyline.clone(),
            notes: self.notes.clone(),
            status: self.status,
            driver_id: driver.map(|d| d.driver_id.clone()),
            driver_name: driver.map(|d| d.name.clone()),
            driver_phone: driver.map(|d| d.phone.clone()),
            driver_vehicle: driver.map(|d| d.vehicle_type.clone()),
            driver_vehicle_number: driver.map(|d| d.vehicle_number.clone()),
            driver_rating: driver.map(|d| d.rating),
            driver_latitude: driver.map(|d| d.location.latitude),
            driver_longitude: driver.map(|d| d.location.longitude),
            driver_to_pickup_polyline: pickup_route.and_then(|r| r.polyline.clone()),
            driver_to_pickup_distance: pickup_route.map(|r| r.distance_text.clone()),
            driver_to_pickup_duration: pickup_route.map(|r| r.duration_text.clone()),
            requested_at: self.requested_at,
            accepted_at: self.accepted_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            cancellation_reason: self.cancellation_reason.clone(),
            cancelled_by: self.cancelled_by.clone(),
            rating: self.rating,
            feedback: self.feedback.clone(),
        }
    }
}
