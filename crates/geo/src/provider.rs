//! Routing collaborator seam.
//!
//! The dispatch core only ever talks to a [`RoutingProvider`]. The HTTP
//! implementation lives in [`crate::google`]; [`NoRouting`] is used when no
//! provider is configured and makes every estimate take the straight-line
//! fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::coord::Coordinate;
use crate::error::GeoError;

/// Distance and duration of a single origin/destination pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub distance_km: f64,
    pub duration_min: f64,
    pub distance_text: String,
    pub duration_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub instruction: String,
    pub distance: String,
    pub duration: String,
    pub start: Coordinate,
    pub end: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Provider-encoded overview path.
    pub polyline: String,
    pub leg: RouteLeg,
    pub steps: Vec<RouteStep>,
}

#[async_trait]
pub trait RoutingProvider: Send + Sync {
    async fn distance_matrix(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<RouteLeg, GeoError>;

    /// `Ok(None)` means the provider answered but found no route.
    async fn directions(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Option<Route>, GeoError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoRouting;

#[async_trait]
impl RoutingProvider for NoRouting {
    async fn distance_matrix(
        &self,
        _origin: Coordinate,
        _destination: Coordinate,
    ) -> Result<RouteLeg, GeoError> {
        Err(GeoError::Unavailable("no routing provider configured".to_string()))
    }

    async fn directions(
        &self,
        _origin: Coordinate,
        _destination: Coordinate,
    ) -> Result<Option<Route>, GeoError> {
        Err(GeoError::Unavailable("no routing provider configured".to_string()))
    }
}
