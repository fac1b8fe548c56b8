use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Requested,
    Accepted,
    Started,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Accepted => "accepted",
            RideStatus::Started => "started",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideView {
    pub ride_id: String,
    pub passenger_id: String,
    pub passenger_name: String,
    pub passenger_phone: String,
    pub pickup_latitude: f64,
    pub pickup_longitude: f64,
    pub pickup_address: String,
    pub destination_latitude: f64,
    pub destination_longitude: f64,
    pub destination_address: String,
    pub distance: String,
    pub distance_text: String,
    pub duration: u32,
    pub duration_text: String,
    pub fare: String,
    pub actual_fare: Option<String>,
    pub commission: Option<String>,
    pub route_polyline: Option<String>,
    pub notes: Option<String>,
    pub status: RideStatus,
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
    pub driver_vehicle: Option<String>,
    pub driver_vehicle_number: Option<String>,
    pub driver_rating: Option<f64>,
    pub driver_latitude: Option<f64>,
    pub driver_longitude: Option<f64>,
    pub driver_to_pickup_polyline: Option<String>,
    pub driver_to_pickup_distance: Option<String>,
    pub driver_to_pickup_duration: Option<String>,
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

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverView {
    pub driver_id: String,
    pub name: String,
    pub phone: String,
    pub vehicle_type: String,
    pub vehicle_number: String,
    pub rating: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub is_online: bool,
    pub is_available: bool,
    pub current_ride: Option<String>,
    pub total_rides: u32,
    pub total_earnings: f64,
    pub last_location_update: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PassengerView {
    pub passenger_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub connected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client -> server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectDriver {
    pub driver_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub vehicle_type: Option<String>,
    pub vehicle_number: Option<String>,
    pub rating: Option<f64>,
    pub latitude: f64,
    pub longitude: f64,
    pub total_rides: Option<u32>,
    pub total_earnings: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectPassenger {
    pub passenger_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideAction {
    pub ride_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideComplete {
    pub ride_id: String,
    pub fare: Option<String>,
}

/// Coordinates and addresses are optional at the serde level so that a
/// missing field surfaces as a validation error naming the field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RideRequest {
    pub passenger_name: Option<String>,
    pub passenger_phone: Option<String>,
    pub pickup_latitude: Option<f64>,
    pub pickup_longitude: Option<f64>,
    pub pickup_address: Option<String>,
    pub destination_latitude: Option<f64>,
    pub destination_longitude: Option<f64>,
    pub destination_address: Option<String>,
    pub notes: Option<String>,
    pub fare: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideCancel {
    pub ride_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRating {
    pub ride_id: String,
    pub rating: u8,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub ride_id: String,
    pub message_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyQuery {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConnected {
    pub status: String,
    pub message: String,
    pub driver_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerConnected {
    pub status: String,
    pub passenger_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverOnline {
    pub driver_id: String,
    pub name: String,
    pub vehicle_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub rating: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverWentOffline {
    pub driver_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverLocation {
    pub driver_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub is_available: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideDriverLocation {
    pub ride_id: String,
    pub driver_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideOffer {
    #[serde(flatten)]
    pub ride: RideView,
    pub estimated_arrival: String,
    pub driver_distance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequestSubmitted {
    pub ride_id: String,
    pub status: String,
    pub message: String,
    pub estimated_fare: String,
    pub distance: String,
    pub duration: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideNotice {
    pub ride_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideAccepted {
    pub ride_id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub driver_phone: String,
    pub driver_vehicle: String,
    pub driver_vehicle_number: String,
    pub driver_rating: f64,
    pub driver_latitude: f64,
    pub driver_longitude: f64,
    pub estimated_arrival: String,
    pub pickup_address: String,
    pub destination_address: String,
    pub fare: String,
    pub distance: String,
    pub duration: String,
    pub route_polyline: Option<String>,
    pub driver_to_pickup_polyline: Option<String>,
    pub driver_to_pickup_distance: Option<String>,
    pub driver_to_pickup_duration: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideAcceptedConfirmation {
    pub ride_id: String,
    pub status: String,
    pub message: String,
    pub passenger_name: String,
    pub passenger_phone: String,
    pub pickup_address: String,
    pub destination_address: String,
    pub fare: String,
    pub distance: String,
    pub duration: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRoomJoined {
    pub ride_id: String,
    pub members: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    pub ride_id: String,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideStarted {
    pub ride_id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub started_at: DateTime<Utc>,
    pub estimated_duration: String,
    pub destination_address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideCompleted {
    pub ride_id: String,
    pub driver_id: String,
    pub driver_name: String,
    pub completed_at: DateTime<Utc>,
    pub fare: String,
    pub distance: String,
    pub duration: String,
    pub rating_request: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideCompletedConfirmation {
    pub ride_id: String,
    pub status: String,
    pub message: String,
    pub fare: String,
    pub commission: String,
    pub total_earnings: f64,
    pub total_rides: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideCancelled {
    pub ride_id: String,
    pub reason: String,
    pub cancelled_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRating {
    pub ride_id: String,
    pub rating: u8,
    pub feedback: String,
    pub new_average_rating: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatingSubmitted {
    pub ride_id: String,
    pub rating: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusNotice {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRelay {
    pub ride_id: String,
    pub sender_id: String,
    pub message_text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearbyDriver {
    pub driver_id: String,
    pub name: String,
    pub phone: String,
    pub vehicle_type: String,
    pub vehicle_number: String,
    pub rating: f64,
    pub distance: f64,
    pub estimated_arrival: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearbyDrivers {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
    pub drivers: Vec<NearbyDriver>,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideHistory {
    pub passenger_id: String,
    pub rides: Vec<RideView>,
    pub total_rides: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    pub code: String,
    pub message: String,
}
