mod support;

use taxi_dispatch::{Actor, DispatchError};
use taxi_protocol::{RideStatus, ServerEvent};

use support::{
    connect_driver, connect_passenger, driver_payload, harness, ride_request, Client,
};

#[tokio::test]
async fn end_to_end_request_accept_start_complete() {
    let h = harness();
    let mut passenger = connect_passenger(&h, "p1").await;
    let mut driver = connect_driver(&h, "d1", 0.0, 0.01).await;
    passenger.drain();
    driver.drain();

    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Requested);
    assert!(ride.ride_id.starts_with("ride_"));

    let offers: Vec<ServerEvent> = driver
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::RideRequest(_)))
        .collect();
    assert_eq!(offers.len(), 1);
    match &offers[0] {
        ServerEvent::RideRequest(offer) => {
            assert_eq!(offer.ride.ride_id, ride.ride_id);
            assert_eq!(offer.driver_distance, "1.11");
            assert_eq!(offer.estimated_arrival, "2 mins");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(passenger.drain_types(), vec!["ride_request_submitted"]);

    let accepted = h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    assert_eq!(accepted.status, RideStatus::Accepted);
    assert_eq!(accepted.driver_id.as_deref(), Some("d1"));
    assert_eq!(
        accepted.driver_to_pickup_polyline.as_deref(),
        Some("fake_polyline")
    );
    assert!(!h.engine.driver("d1").await.unwrap().is_available);
    assert_eq!(
        passenger.drain_types(),
        vec!["ride_accepted", "ride_room_joined"]
    );
    assert_eq!(
        driver.drain_types(),
        vec!["ride_accepted_confirmation", "ride_room_joined"]
    );

    let started = h.engine.start(&ride.ride_id, "d1").await.unwrap();
    assert_eq!(started.status, RideStatus::Started);
    assert!(started.started_at.is_some());

    let completed = h
        .engine
        .complete(&ride.ride_id, "d1", Some("12.50"))
        .await
        .unwrap();
    assert_eq!(completed.status, RideStatus::Completed);
    assert_eq!(completed.actual_fare.as_deref(), Some("12.50"));

    let d1 = h.engine.driver("d1").await.unwrap();
    assert_eq!(d1.total_rides, 1);
    assert!((d1.total_earnings - 12.5 * (1.0 - 0.15)).abs() < 1e-9);
    assert!(d1.is_available && d1.current_ride.is_none());

    assert!(h.engine.live_rides().await.is_empty());
    assert_eq!(h.engine.completed_rides().await.len(), 1);

    let earnings = h.store.earnings();
    assert_eq!(earnings.len(), 1);
    assert!((earnings[0].net_amount - 10.625).abs() < 1e-9);
    assert_eq!(
        h.store.event_types(),
        vec![
            "driver:online",
            "ride:requested",
            "ride:accepted",
            "ride:started",
            "ride:completed"
        ]
    );
}

#[tokio::test]
async fn rating_updates_running_average() {
    let h = harness();
    let _passenger = connect_passenger(&h, "p1").await;
    let client = Client::new();
    let mut payload = driver_payload("d1", 0.0, 0.01);
    payload.rating = Some(4.5);
    payload.total_rides = Some(2);
    h.engine.connect_driver(&client.session, payload).await.unwrap();

    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();
    h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    h.engine.start(&ride.ride_id, "d1").await.unwrap();
    h.engine.complete(&ride.ride_id, "d1", None).await.unwrap();
    assert_eq!(h.engine.driver("d1").await.unwrap().total_rides, 3);

    let rated = h
        .engine
        .rate(&ride.ride_id, "p1", 5, Some("smooth".to_string()))
        .await
        .unwrap();
    assert_eq!(rated.rating, Some(5));

    let rating = h.engine.driver("d1").await.unwrap().rating;
    assert!((rating - (4.5 * 2.0 + 5.0) / 3.0).abs() < 1e-9);
    assert!((rating - 4.67).abs() < 0.01);
}

#[tokio::test]
async fn rating_guards() {
    let h = harness();
    let _p1 = connect_passenger(&h, "p1").await;
    let _d1 = connect_driver(&h, "d1", 0.0, 0.01).await;
    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();

    assert!(matches!(
        h.engine.rate(&ride.ride_id, "p1", 5, None).await,
        Err(DispatchError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.engine.rate("ride_missing", "p1", 5, None).await,
        Err(DispatchError::RideNotFound(_))
    ));

    h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    h.engine.start(&ride.ride_id, "d1").await.unwrap();
    h.engine.complete(&ride.ride_id, "d1", None).await.unwrap();
    assert!(matches!(
        h.engine.rate(&ride.ride_id, "p2", 5, None).await,
        Err(DispatchError::NotAuthorized(_))
    ));
}

#[tokio::test]
async fn rating_a_departed_driver_is_rejected_without_recording() {
    let h = harness();
    let mut passenger = connect_passenger(&h, "p1").await;
    let _d1 = connect_driver(&h, "d1", 0.0, 0.01).await;
    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();
    h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    h.engine.start(&ride.ride_id, "d1").await.unwrap();
    h.engine.complete(&ride.ride_id, "d1", None).await.unwrap();
    h.engine.driver_offline("d1").await.unwrap();
    passenger.drain();

    let err = h
        .engine
        .rate(&ride.ride_id, "p1", 4, Some("fine".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::DriverNotFound("d1".to_string()));

    let ride = h.engine.ride(&ride.ride_id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Completed);
    assert!(ride.rating.is_none());
    assert!(passenger.drain_types().is_empty());
    assert!(!h.store.event_types().iter().any(|t| t == "ride:rated"));
}

#[tokio::test]
async fn transitions_out_of_order_or_by_strangers_fail() {
    let h = harness();
    let _p1 = connect_passenger(&h, "p1").await;
    let _d1 = connect_driver(&h, "d1", 0.0, 0.01).await;
    let _d2 = connect_driver(&h, "d2", 0.0, 0.02).await;
    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();

    let err = h.engine.start(&ride.ride_id, "d1").await.unwrap_err();
    assert_eq!(err.code(), "invalid_transition");

    h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    assert!(matches!(
        h.engine.start(&ride.ride_id, "d2").await,
        Err(DispatchError::NotAuthorized(_))
    ));
    assert!(matches!(
        h.engine.complete(&ride.ride_id, "d1", None).await,
        Err(DispatchError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.engine.complete(&ride.ride_id, "d1", Some("abc")).await,
        Err(DispatchError::Validation(_))
    ));
    assert_eq!(
        h.engine.ride(&ride.ride_id).await.unwrap().status,
        RideStatus::Accepted
    );
}

#[tokio::test]
async fn passenger_cancel_releases_the_driver() {
    let h = harness();
    let mut passenger = connect_passenger(&h, "p1").await;
    let mut driver = connect_driver(&h, "d1", 0.0, 0.01).await;
    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();
    h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    passenger.drain();
    driver.drain();

    let cancelled = h
        .engine
        .cancel(&ride.ride_id, Actor::Passenger("p1".to_string()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some("cancelled by passenger")
    );
    assert!(cancelled.driver_id.is_none());
    assert!(cancelled.cancelled_at.is_some());

    let d1 = h.engine.driver("d1").await.unwrap();
    assert!(d1.is_available && d1.current_ride.is_none());
    assert_eq!(driver.drain_types(), vec!["ride_cancelled"]);
    assert_eq!(passenger.drain_types(), vec!["ride_cancelled_confirmation"]);

    let again = h
        .engine
        .cancel(&ride.ride_id, Actor::Passenger("p1".to_string()), None)
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn failing_store_never_rolls_back_state() {
    let h = harness();
    let _p1 = connect_passenger(&h, "p1").await;
    let _d1 = connect_driver(&h, "d1", 0.0, 0.01).await;
    h.store.set_failing(true);

    let ride = h
        .engine
        .request_ride("p1", ride_request((0.0, 0.0), (0.0, 0.1)))
        .await
        .unwrap();
    h.engine.accept(&ride.ride_id, "d1").await.unwrap();
    h.engine.start(&ride.ride_id, "d1").await.unwrap();
    let done = h
        .engine
        .complete(&ride.ride_id, "d1", Some("12.50"))
        .await
        .unwrap();

    assert_eq!(done.status, RideStatus::Completed);
    assert_eq!(h.engine.driver("d1").await.unwrap().total_rides, 1);
    assert!(h.store.ride(&ride.ride_id).is_none());
    assert!(h.store.earnings().is_empty());
}
