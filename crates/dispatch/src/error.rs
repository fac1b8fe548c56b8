use thiserror::Error;

use taxi_protocol::RideStatus;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("ride {0} not found")]
    RideNotFound(String),
    #[error("driver {0} not found")]
    DriverNotFound(String),
    #[error("passenger {0} not found")]
    PassengerNotFound(String),
    #[error("ride {0} is no longer pending")]
    RideNotPending(String),
    #[error("ride {0} already processed")]
    RideAlreadyProcessed(String),
    #[error("driver {0} is not available")]
    DriverUnavailable(String),
    #[error("cannot {action} ride {ride_id} while {status}")]
    InvalidTransition {
        ride_id: String,
        action: &'static str,
        status: RideStatus,
    },
    #[error("not authorized: {0}")]
    NotAuthorized(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}

impl DispatchError {
    /// Stable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "validation_error",
            DispatchError::RideNotFound(_) => "ride_not_found",
            DispatchError::DriverNotFound(_) => "driver_not_found",
            DispatchError::PassengerNotFound(_) => "passenger_not_found",
            DispatchError::RideNotPending(_) => "ride_not_pending",
            DispatchError::RideAlreadyProcessed(_) => "ride_already_processed",
            DispatchError::DriverUnavailable(_) => "driver_unavailable",
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::NotAuthorized(_) => "not_authorized",
            DispatchError::UpstreamUnavailable(_) => "upstream_unavailable",
        }
    }
}

pub fn validation(message: impl Into<String>) -> DispatchError {
    DispatchError::Validation(message.into())
}
