use std::collections::HashMap;

use chrono::{DateTime, Utc};

use taxi_geo::{haversine_km, Coordinate};
use taxi_protocol::{ConnectDriver, ConnectPassenger, DriverView, PassengerView};

use crate::error::{validation, DispatchError};

pub const DEFAULT_VEHICLE_TYPE: &str = "Sedan";
pub const DEFAULT_DRIVER_NAME: &str = "Driver";
pub const DEFAULT_RATING: f64 = 4.5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Participant {
    Driver(String),
    Passenger(String),
}

impl Participant {
    pub fn id(&self) -> &str {
        match self {
            Participant::Driver(id) | Participant::Passenger(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriverDescriptor {
    pub driver_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub vehicle_type: Option<String>,
    pub vehicle_number: Option<String>,
    pub rating: Option<f64>,
    pub location: Coordinate,
    pub total_rides: Option<u32>,
    pub total_earnings: Option<f64>,
}

impl DriverDescriptor {
    pub fn new(driver_id: &str, location: Coordinate) -> Self {
        Self {
            driver_id: driver_id.to_string(),
            name: None,
            phone: None,
            vehicle_type: None,
            vehicle_number: None,
            rating: None,
            location,
            total_rides: None,
            total_earnings: None,
        }
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.driver_id.trim().is_empty() {
            return Err(validation("missing required field: driver_id"));
        }
        if !self.location.is_valid() {
            return Err(validation("invalid driver location"));
        }
        if let Some(rating) = self.rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(validation("rating must be between 0 and 5"));
            }
        }
        Ok(())
    }
}

impl From<ConnectDriver> for DriverDescriptor {
    fn from(value: ConnectDriver) -> Self {
        Self {
            driver_id: value.driver_id,
            name: value.name,
            phone: value.phone,
            vehicle_type: value.vehicle_type,
            vehicle_number: value.vehicle_number,
            rating: value.rating,
            location: Coordinate::new(value.latitude, value.longitude),
            total_rides: value.total_rides,
            total_earnings: value.total_earnings,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassengerDescriptor {
    pub passenger_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

impl PassengerDescriptor {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.passenger_id.trim().is_empty() {
            return Err(validation("missing required field: passenger_id"));
        }
        Ok(())
    }
}

impl From<ConnectPassenger> for PassengerDescriptor {
    fn from(value: ConnectPassenger) -> Self {
        Self {
            passenger_id: value.passenger_id,
            name: value.name,
            phone: value.phone,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Driver {
    pub driver_id: String,
    pub name: String,
    pub phone: String,
    pub vehicle_type: String,
    pub vehicle_number: String,
    pub rating: f64,
    pub location: Coordinate,
    pub is_online: bool,
    pub is_available: bool,
    pub current_ride: Option<String>,
    pub total_rides: u32,
    pub total_earnings: f64,
    pub last_location_update: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub session_id: String,
    registered_seq: u64,
}

impl Driver {
    pub fn view(&self) -> DriverView {
        DriverView {
            driver_id: self.driver_id.clone(),
            name: self.name.clone(),
            phone: self.phone.clone(),
            vehicle_type: self.vehicle_type.clone(),
            vehicle_number: self.vehicle_number.clone(),
            rating: self.rating,
            latitude: self.location.latitude,
            longitude: self.location.longitude,
            is_online: self.is_online,
            is_available: self.is_available,
            current_ride: self.current_ride.clone(),
            total_rides: self.total_rides,
            total_earnings: self.total_earnings,
            last_location_update: self.last_location_update,
            connected_at: self.connected_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Passenger {
    pub passenger_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub session_id: String,
    pub connected_at: DateTime<Utc>,
}

impl Passenger {
    pub fn view(&self) -> PassengerView {
        PassengerView {
            passenger_id: self.passenger_id.clone(),
            name: self.name.clone(),
            phone: self.phone.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// A driver picked by [`PresenceRegistry::find_available`].
#[derive(Debug, Clone)]
pub struct Candidate {
    pub driver: Driver,
    pub distance_km: f64,
}

/// Directory of connected drivers and passengers plus the session
/// back-references. All mutation goes through these methods; the
/// `available ⇔ current_ride.is_none()` rule for online drivers is kept here.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    drivers: HashMap<String, Driver>,
    passengers: HashMap<String, Passenger>,
    sessions: HashMap<String, Participant>,
    next_seq: u64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the driver and binds it to `session_id`. A
    /// re-registration keeps the driver's place in the tie-break order and
    /// any ride it is still carrying.
    pub fn register_driver(
        &mut self,
        descriptor: DriverDescriptor,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Driver {
        let previous = self.drivers.remove(&descriptor.driver_id);
        if let Some(previous) = &previous {
            if previous.session_id != session_id {
                self.sessions.remove(&previous.session_id);
            }
        }
        let registered_seq = match &previous {
            Some(previous) => previous.registered_seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        let current_ride = previous.as_ref().and_then(|p| p.current_ride.clone());
        let driver = Driver {
            driver_id: descriptor.driver_id.clone(),
            name: descriptor
                .name
                .unwrap_or_else(|| DEFAULT_DRIVER_NAME.to_string()),
            phone: descriptor.phone.unwrap_or_default(),
            vehicle_type: descriptor
                .vehicle_type
                .unwrap_or_else(|| DEFAULT_VEHICLE_TYPE.to_string()),
            vehicle_number: descriptor.vehicle_number.unwrap_or_default(),
            rating: descriptor
                .rating
                .or(previous.as_ref().map(|p| p.rating))
                .unwrap_or(DEFAULT_RATING),
            location: descriptor.location,
            is_online: true,
            is_available: current_ride.is_none(),
            current_ride,
            total_rides: descriptor
                .total_rides
                .or(previous.as_ref().map(|p| p.total_rides))
                .unwrap_or(0),
            total_earnings: descriptor
                .total_earnings
                .or(previous.as_ref().map(|p| p.total_earnings))
                .unwrap_or(0.0),
            last_location_update: now,
            connected_at: now,
            session_id: session_id.to_string(),
            registered_seq,
        };
        self.sessions.insert(
            session_id.to_string(),
            Participant::Driver(driver.driver_id.clone()),
        );
        self.drivers.insert(driver.driver_id.clone(), driver.clone());
        driver
    }

    pub fn register_passenger(
        &mut self,
        descriptor: PassengerDescriptor,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Passenger {
        if let Some(previous) = self.passengers.get(&descriptor.passenger_id) {
            if previous.session_id != session_id {
                let stale = previous.session_id.clone();
                self.sessions.remove(&stale);
            }
        }
        let passenger = Passenger {
            passenger_id: descriptor.passenger_id.clone(),
            name: descriptor.name,
            phone: descriptor.phone,
            session_id: session_id.to_string(),
            connected_at: now,
        };
        self.sessions.insert(
            session_id.to_string(),
            Participant::Passenger(passenger.passenger_id.clone()),
        );
        self.passengers
            .insert(passenger.passenger_id.clone(), passenger.clone());
        passenger
    }

    pub fn driver(&self, driver_id: &str) -> Option<&Driver> {
        self.drivers.get(driver_id)
    }

    pub fn passenger(&self, passenger_id: &str) -> Option<&Passenger> {
        self.passengers.get(passenger_id)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Driver> {
        self.drivers.values()
    }

    pub fn passengers(&self) -> impl Iterator<Item = &Passenger> {
        self.passengers.values()
    }

    pub fn participant_for_session(&self, session_id: &str) -> Option<&Participant> {
        self.sessions.get(session_id)
    }

    pub fn unbind_session(&mut self, session_id: &str) -> Option<Participant> {
        self.sessions.remove(session_id)
    }

    /// Returns `None` (and changes nothing) for unknown drivers.
    pub fn update_driver_location(
        &mut self,
        driver_id: &str,
        location: Coordinate,
        at: DateTime<Utc>,
    ) -> Option<&Driver> {
        let driver = self.drivers.get_mut(driver_id)?;
        driver.location = location;
        driver.last_location_update = at;
        Some(driver)
    }

    /// Returns whether the flag changed. Offline drivers are left alone, and
    /// a driver carrying a ride cannot be made available.
    pub fn set_availability(&mut self, driver_id: &str, available: bool) -> bool {
        let Some(driver) = self.drivers.get_mut(driver_id) else {
            return false;
        };
        if !driver.is_online {
            return false;
        }
        if available && driver.current_ride.is_some() {
            return false;
        }
        let changed = driver.is_available != available;
        driver.is_available = available;
        changed
    }

    /// Flags the driver offline and hands back the ride it was carrying, if
    /// any. The ride reference is left in place for the lifecycle to clear.
    pub fn mark_offline(&mut self, driver_id: &str) -> Option<Option<String>> {
        let driver = self.drivers.get_mut(driver_id)?;
        driver.is_online = false;
        driver.is_available = false;
        Some(driver.current_ride.clone())
    }

    pub fn remove_driver(&mut self, driver_id: &str) -> Option<Driver> {
        let driver = self.drivers.remove(driver_id)?;
        if matches!(self.sessions.get(&driver.session_id), Some(Participant::Driver(id)) if id == driver_id)
        {
            self.sessions.remove(&driver.session_id);
        }
        Some(driver)
    }

    pub fn remove_passenger(&mut self, passenger_id: &str) -> Option<Passenger> {
        let passenger = self.passengers.remove(passenger_id)?;
        if matches!(self.sessions.get(&passenger.session_id), Some(Participant::Passenger(id)) if id == passenger_id)
        {
            self.sessions.remove(&passenger.session_id);
        }
        Some(passenger)
    }

    /// Online, available drivers within `radius_km` of `origin`, nearest
    /// first; equal distances keep registration order.
    pub fn find_available(&self, origin: Coordinate, radius_km: f64) -> Vec<Candidate> {
        let mut candidates: Vec<(u64, Candidate)> = self
            .drivers
            .values()
            .filter(|driver| driver.is_online && driver.is_available)
            .filter_map(|driver| {
                let distance_km = haversine_km(origin, driver.location);
                (distance_km <= radius_km).then(|| {
                    (
                        driver.registered_seq,
                        Candidate {
                            driver: driver.clone(),
                            distance_km,
                        },
                    )
                })
            })
            .collect();
        candidates.sort_by(|(seq_a, a), (seq_b, b)| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then(seq_a.cmp(seq_b))
        });
        candidates.into_iter().map(|(_, c)| c).collect()
    }

    pub fn assign_ride(&mut self, driver_id: &str, ride_id: &str) -> Result<&Driver, DispatchError> {
        let driver = self
            .drivers
            .get_mut(driver_id)
            .ok_or_else(|| DispatchError::DriverNotFound(driver_id.to_string()))?;
        if !driver.is_online || !driver.is_available || driver.current_ride.is_some() {
            return Err(DispatchError::DriverUnavailable(driver_id.to_string()));
        }
        driver.current_ride = Some(ride_id.to_string());
        driver.is_available = false;
        Ok(driver)
    }

    /// Clears the ride reference if it still points at `ride_id`; the driver
    /// becomes available again only while online.
    pub fn release_driver(&mut self, driver_id: &str, ride_id: &str) {
        if let Some(driver) = self.drivers.get_mut(driver_id) {
            if driver.current_ride.as_deref() == Some(ride_id) {
                driver.current_ride = None;
                driver.is_available = driver.is_online;
            }
        }
    }

    /// Books a finished ride: one more ride, `net` more earnings, driver
    /// released. Returns the new totals.
    pub fn record_completion(
        &mut self,
        driver_id: &str,
        ride_id: &str,
        net: f64,
    ) -> Option<(u32, f64)> {
        self.release_driver(driver_id, ride_id);
        let driver = self.drivers.get_mut(driver_id)?;
        driver.total_rides += 1;
        driver.total_earnings += net;
        Some((driver.total_rides, driver.total_earnings))
    }

    /// Running average over the driver's completed rides:
    /// `(old * (n - 1) + score) / n`.
    pub fn apply_rating(&mut self, driver_id: &str, score: u8) -> Option<f64> {
        let driver = self.drivers.get_mut(driver_id)?;
        let score = f64::from(score);
        driver.rating = if driver.total_rides == 0 {
            score
        } else {
            let n = f64::from(driver.total_rides);
            (driver.rating * (n - 1.0) + score) / n
        };
        Some(driver.rating)
    }
}
