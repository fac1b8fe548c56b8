//! Real-time ride dispatch core: presence, matching and the ride lifecycle.

pub mod engine;
pub mod error;
pub mod fanout;
pub mod fare;
pub mod lifecycle;
pub mod presence;
pub mod ride;

pub use engine::{DispatchEngine, EngineSettings, EngineStats, Session};
pub use error::DispatchError;
pub use fanout::{EventSender, NotificationFanout, RideGroup};
pub use fare::{CommissionSplit, FareCalculator};
pub use presence::{
    Candidate, Driver, DriverDescriptor, Participant, Passenger, PassengerDescriptor,
    PresenceRegistry,
};
pub use ride::{Actor, Ride, RideDraft};
