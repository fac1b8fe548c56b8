use chrono::{DateTime, Utc};
use uuid::Uuid;

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// `ride_<unix millis>_<8 hex chars>`: sortable by creation time, unique per call.
pub fn new_ride_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ride_{}_{}", now.timestamp_millis(), &suffix[..8])
}

pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}
