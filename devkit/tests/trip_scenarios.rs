//! End-to-end fleet scenarios: kernel, registry, hub and embedded devices
//! wired together in one process.

use std::time::Duration;

use fleet_devkit::{scooter, station, test_config, TestHarness};
use fleet_kernel::error::TripError;
use fleet_kernel::health::KernelHealth;
use fleet_kernel::models::TripOutcome;
use fleet_kernel::mqtt::{HEALTH_TOPIC, TELEMETRY_TOPIC};
use fleet_kernel::storage::{OrderStore, ScooterStore};
use fleet_sim::{Position, TelemetryMessage};

fn one_scooter(battery: f64) -> TestHarness {
    let mut cfg = test_config();
    cfg.scooters = vec![scooter(1, 0.0, 0.0, battery)];
    cfg.stations = vec![station(1, "Near", 0.001, 0.001), station(2, "Far", 1.0, 1.0)];
    cfg.embedded_devices = 1;
    TestHarness::with_config(cfg)
}

fn drain(viewer: &mut fleet_kernel::Viewer) -> Vec<TelemetryMessage> {
    let mut seen = Vec::new();
    while let Some(msg) = viewer.try_recv() {
        seen.push(msg);
    }
    seen
}

#[tokio::test]
async fn ten_step_trip_reaches_the_station() {
    let harness = one_scooter(100.0);
    harness.wait_connected(1).await.unwrap();
    let mut viewer = harness.app.hub.subscribe();

    let trip = harness.app.trips.start_trip(1, 1, 42).await.unwrap();

    assert_eq!(trip.outcome, TripOutcome::Arrived);
    assert!((trip.distance - 0.001414).abs() < 1e-6);
    assert!((trip.battery - 99.0).abs() < 1e-9);

    let samples = drain(&mut viewer);
    assert_eq!(samples.len(), 10);
    assert!(samples.iter().all(|m| m.scooter_id == 1));
    assert_eq!(samples.last().unwrap().position(), Position::new(0.001, 0.001));

    let stored = harness.store.get_scooter(1).await.unwrap();
    assert_eq!(stored.station_id, Some(1));
    assert_eq!(stored.position, Position::new(0.001, 0.001));
    assert!((stored.battery_percent - 99.0).abs() < 1e-9);

    let orders = harness.store.list_orders().await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].user_id, 42);
    assert_eq!(orders[0].status_start_id, trip.start_snapshot_id);
    assert_eq!(orders[0].status_end_id, trip.end_snapshot_id);
}

#[tokio::test]
async fn trip_stops_when_the_battery_dies() {
    let mut cfg = test_config();
    cfg.scooters = vec![scooter(1, 0.0, 0.0, 15.0)];
    cfg.stations = vec![station(2, "Far", 1.0, 1.0)];
    cfg.embedded_devices = 1;
    cfg.motion.discharge_per_step = 3.0;
    let harness = TestHarness::with_config(cfg);
    harness.wait_connected(1).await.unwrap();
    let mut viewer = harness.app.hub.subscribe();

    let trip = harness.app.trips.start_trip(1, 2, 7).await.unwrap();

    assert_eq!(trip.outcome, TripOutcome::BatteryDepleted);
    assert_eq!(trip.battery, 0.0);
    let samples = drain(&mut viewer);
    assert_eq!(samples.len(), 5);
    let last = samples.last().unwrap().position();
    assert!((last.latitude - 0.0005).abs() < 1e-12);
    assert!((last.longitude - 0.0005).abs() < 1e-12);

    let stored = harness.store.get_scooter(1).await.unwrap();
    assert_eq!(stored.station_id, None);
    assert!(!stored.is_rentable());

    // The dead device leaves its slot.
    tokio::time::timeout(Duration::from_secs(2), async {
        while harness.app.registry.is_connected(1) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn second_trip_on_a_busy_scooter_is_refused() {
    let mut cfg = test_config();
    cfg.scooters = vec![scooter(1, 0.0, 0.0, 90.0)];
    cfg.stations = vec![station(1, "Near", 0.001, 0.001)];
    cfg.embedded_devices = 1;
    cfg.motion.tick_interval_ms = 20;
    let harness = TestHarness::with_config(cfg);
    harness.wait_connected(1).await.unwrap();

    let trips = harness.app.trips.clone();
    let first = tokio::spawn(async move { trips.start_trip(1, 1, 1).await });
    while !harness.app.registry.has_active_trip(1) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let second = harness.app.trips.start_trip(1, 1, 2).await;
    assert!(matches!(second, Err(TripError::TripInProgress(1))));
    assert!(matches!(
        harness.app.trips.redirect(1, Position::new(0.5, 0.5)),
        Err(TripError::TripInProgress(1))
    ));

    let first = first.await.unwrap().unwrap();
    assert_eq!(first.outcome, TripOutcome::Arrived);
    assert_eq!(harness.store.list_orders().await.unwrap().len(), 1);
    assert!(!harness.app.registry.has_active_trip(1));
}

#[tokio::test]
async fn scooters_without_a_device_are_unreachable() {
    let harness = TestHarness::new(
        vec![scooter(1, 0.0, 0.0, 90.0)],
        vec![station(1, "Near", 0.001, 0.001)],
    );

    assert!(matches!(
        harness.app.trips.start_trip(1, 1, 1).await,
        Err(TripError::DeviceUnreachable(1))
    ));
    assert!(matches!(
        harness.app.trips.redirect(99, Position::new(0.0, 0.0)),
        Err(TripError::DeviceUnreachable(99))
    ));
    assert!(harness.store.list_orders().await.unwrap().is_empty());
}

#[tokio::test]
async fn every_viewer_sees_each_sample_once() {
    let harness = one_scooter(100.0);
    harness.wait_connected(1).await.unwrap();
    let mut first = harness.app.hub.subscribe();
    let mut second = harness.app.hub.subscribe();

    harness.app.trips.start_trip(1, 1, 3).await.unwrap();
    let mut late = harness.app.hub.subscribe();

    let a = drain(&mut first);
    let b = drain(&mut second);
    assert_eq!(a.len(), 10);
    assert_eq!(a, b);
    for pair in a.windows(2) {
        assert_ne!(pair[0].position(), pair[1].position());
    }

    assert!(late.try_recv().is_none());
    drop(first);
    assert_eq!(harness.app.hub.viewer_count(), 2);
}

#[tokio::test]
async fn bus_receives_telemetry_and_health() {
    let mut harness = one_scooter(100.0);
    harness.wait_connected(1).await.unwrap();
    let bus = harness.attach_bus();
    harness.publish_health(bus.clone(), Duration::from_millis(20));

    harness.app.trips.start_trip(1, 1, 5).await.unwrap();

    assert!(bus.wait_for(TELEMETRY_TOPIC, 10, Duration::from_secs(2)).await);
    let mirrored: Vec<TelemetryMessage> = bus.json_messages(TELEMETRY_TOPIC).unwrap();
    assert_eq!(mirrored.len(), 10);
    assert_eq!(mirrored[9].position(), Position::new(0.001, 0.001));

    assert!(bus.wait_for(HEALTH_TOPIC, 1, Duration::from_secs(2)).await);
    let health: KernelHealth = bus.last_json_message(HEALTH_TOPIC).unwrap().unwrap();
    assert_eq!(health.scooters_tracked, 1);
    assert_eq!(health.devices_connected, 1);
    assert_eq!(health.mqtt_status, "disabled");
}

#[tokio::test]
async fn bus_failures_do_not_stop_the_fleet() {
    let mut harness = one_scooter(100.0);
    harness.wait_connected(1).await.unwrap();
    let bus = harness.attach_bus();
    bus.set_failing(true);

    let trip = harness.app.trips.start_trip(1, 1, 5).await.unwrap();
    assert_eq!(trip.outcome, TripOutcome::Arrived);
    assert!(bus.wait_for(TELEMETRY_TOPIC, 10, Duration::from_secs(2)).await);
}
