use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::messages::*;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    ConnectDriver(ConnectDriver),
    LocationUpdate(LocationUpdate),
    RideAccept(RideAction),
    RideReject(RideAction),
    RideStart(RideAction),
    RideComplete(RideComplete),
    DriverOffline(NoPayload),
    DriverAvailable(NoPayload),
    DriverMessage(ChatMessage),
    ConnectPassenger(ConnectPassenger),
    RideRequest(RideRequest),
    RideCancel(RideCancel),
    RideRating(RideRating),
    PassengerMessage(ChatMessage),
    GetNearbyDrivers(NearbyQuery),
    GetRideHistory(HistoryQuery),
}

pub const CLIENT_EVENT_TYPES: &[&str] = &[
    "connect_driver",
    "location_update",
    "ride_accept",
    "ride_reject",
    "ride_start",
    "ride_complete",
    "driver_offline",
    "driver_available",
    "driver_message",
    "connect_passenger",
    "ride_request",
    "ride_cancel",
    "ride_rating",
    "passenger_message",
    "get_nearby_drivers",
    "get_ride_history",
];

impl ClientEvent {
    /// Turns a raw frame into a typed event. Unknown types and payloads that
    /// do not match the event schema are rejected here, before any state is
    /// touched.
    pub fn decode(envelope: &Envelope) -> Result<ClientEvent, ProtocolError> {
        let message_type = envelope.message_type.as_str();
        if !CLIENT_EVENT_TYPES.contains(&message_type) {
            return Err(ProtocolError::UnknownType(message_type.to_string()));
        }
        let payload = match &envelope.payload {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let tagged = serde_json::json!({ "type": message_type, "payload": payload });
        serde_json::from_value(tagged).map_err(|err| ProtocolError::Malformed {
            event: message_type.to_string(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    DriverConnected(DriverConnected),
    PassengerConnected(PassengerConnected),
    DriverOnline(DriverOnline),
    DriverOffline(DriverWentOffline),
    DriverLocationUpdate(DriverLocation),
    RideDriverLocation(RideDriverLocation),
    RideRequest(RideOffer),
    RideRequestSubmitted(RideRequestSubmitted),
    NoDriversAvailable(RideNotice),
    RideTimeout(RideNotice),
    RideAccepted(RideAccepted),
    RideAcceptedConfirmation(RideAcceptedConfirmation),
    RideRoomJoined(RideRoomJoined),
    RideRejectedConfirmation(Confirmation),
    RideStarted(RideStarted),
    RideStartedConfirmation(Confirmation),
    RideCompleted(RideCompleted),
    RideCompletedConfirmation(RideCompletedConfirmation),
    RideCancelled(RideCancelled),
    RideCancelledConfirmation(Confirmation),
    NewRating(NewRating),
    RatingSubmitted(RatingSubmitted),
    DriverAvailableConfirmation(StatusNotice),
    DriverMessage(ChatRelay),
    PassengerMessage(ChatRelay),
    NearbyDrivers(NearbyDrivers),
    RideHistory(RideHistory),
    Error(ServerError),
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error(ServerError {
            code: code.to_string(),
            message: message.into(),
        })
    }

    pub fn to_envelope(&self, id: &str, ts: i64) -> anyhow::Result<Envelope> {
        let mut value = serde_json::to_value(self)?;
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("server event serialized without a type"))?;
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok(Envelope {
            message_type,
            id: id.to_string(),
            ts,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::envelope::parse_envelope;

    #[test]
    fn decodes_typed_client_events() {
        let env = parse_envelope(
            r#"{"type":"ride_complete","id":"m1","ts":1,"payload":{"ride_id":"r1","fare":"12.50"}}"#,
        )
        .unwrap();
        match ClientEvent::decode(&env).unwrap() {
            ClientEvent::RideComplete(payload) => {
                assert_eq!(payload.ride_id, "r1");
                assert_eq!(payload.fare.as_deref(), Some("12.50"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn payloadless_events_decode_from_null() {
        let env = parse_envelope(r#"{"type":"driver_offline"}"#).unwrap();
        assert!(matches!(
            ClientEvent::decode(&env).unwrap(),
            ClientEvent::DriverOffline(_)
        ));
    }

    #[test]
    fn unknown_types_are_rejected() {
        let env = parse_envelope(r#"{"type":"teleport","payload":{}}"#).unwrap();
        assert!(matches!(
            ClientEvent::decode(&env),
            Err(ProtocolError::UnknownType(t)) if t == "teleport"
        ));
    }

    #[test]
    fn schema_mismatch_is_malformed() {
        let env =
            parse_envelope(r#"{"type":"ride_rating","payload":{"ride_id":"r1","rating":"five"}}"#)
                .unwrap();
        assert!(matches!(
            ClientEvent::decode(&env),
            Err(ProtocolError::Malformed { event, .. }) if event == "ride_rating"
        ));
    }

    #[test]
    fn server_events_flatten_into_envelopes() {
        let event = ServerEvent::NoDriversAvailable(RideNotice {
            ride_id: "r1".to_string(),
            message: "No drivers available in your area".to_string(),
            timestamp: Utc::now(),
        });
        let env = event.to_envelope("m1", 42).unwrap();
        assert_eq!(env.message_type, "no_drivers_available");
        assert_eq!(env.payload["ride_id"], "r1");
        assert_eq!(env.ts, 42);

        let env = ServerEvent::error("ride_not_found", "Ride not found")
            .to_envelope("m2", 0)
            .unwrap();
        assert_eq!(env.message_type, "error");
        assert_eq!(env.payload["code"], "ride_not_found");
    }
}
