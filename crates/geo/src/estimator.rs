use std::sync::Arc;

use tracing::warn;

use crate::coord::{haversine_km, Coordinate};
use crate::provider::{NoRouting, Route, RouteLeg, RoutingProvider};

/// Fallback travel-time policy when the provider cannot answer.
pub const FALLBACK_MINUTES_PER_KM: f64 = 2.0;

#[derive(Clone)]
pub struct GeoEstimator {
    provider: Arc<dyn RoutingProvider>,
}

impl GeoEstimator {
    pub fn new(provider: Arc<dyn RoutingProvider>) -> Self {
        Self { provider }
    }

    pub fn straight_line() -> Self {
        Self::new(Arc::new(NoRouting))
    }

    /// Never fails: provider errors degrade to [`fallback_estimate`].
    pub async fn distance_and_duration(&self, origin: Coordinate, destination: Coordinate) -> RouteLeg {
        match self.provider.distance_matrix(origin, destination).await {
            Ok(leg) => leg,
            Err(err) => {
                warn!(error = %err, "distance matrix failed, using straight-line estimate");
                fallback_estimate(origin, destination)
            }
        }
    }

    pub async fn route_polyline(&self, origin: Coordinate, destination: Coordinate) -> Option<Route> {
        match self.provider.directions(origin, destination).await {
            Ok(route) => route,
            Err(err) => {
                warn!(error = %err, "directions lookup failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for GeoEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoEstimator").finish_non_exhaustive()
    }
}

pub fn fallback_estimate(origin: Coordinate, destination: Coordinate) -> RouteLeg {
    let distance_km = haversine_km(origin, destination);
    let duration_min = distance_km * FALLBACK_MINUTES_PER_KM;
    RouteLeg {
        distance_km,
        duration_min,
        distance_text: format!("{distance_km:.1} km"),
        duration_text: format!("{} mins", duration_min.round() as i64),
    }
}
