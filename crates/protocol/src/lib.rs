pub mod envelope;
pub mod events;
pub mod messages;

pub use envelope::*;
pub use events::*;
pub use messages::*;
