use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::info;

use taxi_dispatch::DispatchEngine;

/// Evicts finished rides past the retention window every `every`.
pub fn spawn_sweep_loop(engine: DispatchEngine, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = engine.sweep(Utc::now()).await;
            if evicted > 0 {
                info!(evicted, "swept finished rides");
            }
        }
    })
}

pub fn spawn_stats_loop(engine: DispatchEngine, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = engine.stats().await;
            info!(
                drivers_online = stats.drivers_online,
                drivers_available = stats.drivers_available,
                passengers = stats.passengers,
                live_rides = stats.live_rides,
                completed_rides = stats.completed_rides,
                cancelled_rides = stats.cancelled_rides,
                connected_clients = stats.connected_clients,
                "dispatch status"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taxi_dispatch::{Actor, EngineSettings, Session};
    use taxi_geo::GeoEstimator;
    use taxi_protocol::{ConnectPassenger, RideRequest};
    use taxi_store::mock::MemoryStore;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_evicts_after_retention() {
        let settings = EngineSettings {
            retention: Duration::ZERO,
            ..EngineSettings::default()
        };
        let engine = DispatchEngine::new(
            settings,
            GeoEstimator::straight_line(),
            Arc::new(MemoryStore::new()),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        engine
            .connect_passenger(
                &Session::new(tx),
                ConnectPassenger {
                    passenger_id: "p1".to_string(),
                    name: None,
                    phone: None,
                },
            )
            .await
            .unwrap();
        let ride = engine
            .request_ride(
                "p1",
                RideRequest {
                    pickup_latitude: Some(0.0),
                    pickup_longitude: Some(0.0),
                    pickup_address: Some("A".to_string()),
                    destination_latitude: Some(0.0),
                    destination_longitude: Some(0.1),
                    destination_address: Some("B".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine
            .cancel(&ride.ride_id, Actor::Passenger("p1".to_string()), None)
            .await
            .unwrap();
        assert_eq!(engine.cancelled_rides().await.len(), 1);

        let handle = spawn_sweep_loop(engine.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(engine.cancelled_rides().await.is_empty());
        assert!(engine.ride(&ride.ride_id).await.is_none());
        handle.abort();
    }
}
