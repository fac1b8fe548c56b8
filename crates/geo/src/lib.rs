pub mod coord;
pub mod error;
pub mod estimator;
pub mod google;
pub mod provider;

pub use coord::*;
pub use error::GeoError;
pub use estimator::*;
pub use provider::*;
