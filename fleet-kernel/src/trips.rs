/**
 * TRIP ORCHESTRATOR - one rental, from dispatch to order
 *
 * Sequence for `start_trip`:
 * 1. check the scooter is rentable and the station exists
 * 2. claim the scooter's trip slot (device must be connected)
 * 3. snapshot the starting status, dispatch the device toward the station
 * 4. wait for the device's trip report, giving up after `idle_timeout`
 *    without any telemetry from the scooter
 * 5. snapshot the final status, update the scooter, create the order
 *
 * Steps 3 to 5 are not transactional. If storage fails after the device has
 * moved, the error is surfaced and the movement stays.
 */

use std::sync::Arc;
use std::time::Duration;

use fleet_sim::{MotionProfile, Outcome, Position, ScooterId, StationId, UserId};
use tracing::{info, warn};

use crate::error::{RegistryError, TripError};
use crate::models::{NewOrder, ScooterStatusUpdate, Trip, TripOutcome};
use crate::registry::{StreamRegistry, TripSignal};
use crate::storage::FleetStore;

/// Missed ticks after which a silent scooter's trip is closed.
pub const IDLE_TICKS: u32 = 20;
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Silence tolerated before a trip is closed as interrupted.
pub fn default_idle_timeout(profile: &MotionProfile) -> Duration {
    profile
        .tick_interval
        .saturating_mul(IDLE_TICKS)
        .max(MIN_IDLE_TIMEOUT)
}

#[derive(Clone)]
pub struct TripOrchestrator {
    store: Arc<dyn FleetStore>,
    registry: StreamRegistry,
    /// Used to estimate the battery of a trip the device never reported.
    discharge_per_step: f64,
    idle_timeout: Duration,
}

impl TripOrchestrator {
    pub fn new(
        store: Arc<dyn FleetStore>,
        registry: StreamRegistry,
        discharge_per_step: f64,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            discharge_per_step,
            idle_timeout,
        }
    }

    pub async fn start_trip(
        &self,
        scooter_id: ScooterId,
        station_id: StationId,
        user_id: UserId,
    ) -> Result<Trip, TripError> {
        let scooter = self.store.get_scooter(scooter_id).await?;
        if !scooter.is_rentable() {
            return Err(TripError::NotRentable {
                scooter_id,
                battery: scooter.battery_percent,
            });
        }
        let station = self.store.get_station(station_id).await?;

        let ticket = self.registry.begin_trip(scooter_id).map_err(|e| match e {
            RegistryError::TripInProgress(id) => TripError::TripInProgress(id),
            _ => TripError::DeviceUnreachable(scooter_id),
        })?;

        let start_position = self
            .registry
            .last_known(scooter_id)
            .map(|live| live.position)
            .unwrap_or(scooter.position);
        let start = self
            .store
            .record_status_snapshot(scooter_id, start_position, scooter.battery_percent)
            .await?;

        self.registry
            .dispatch(scooter_id, station.position, Some(ticket.trip_id()))
            .map_err(|_| TripError::DeviceUnreachable(scooter_id))?;
        info!(scooter_id, station_id, user_id, trip_id = %ticket.trip_id(), "trip started");

        let (end_position, battery, outcome) = match ticket.wait(self.idle_timeout).await {
            TripSignal::Ended(report) => {
                let outcome = match report.outcome {
                    Outcome::Arrived => TripOutcome::Arrived,
                    Outcome::Discharged => TripOutcome::BatteryDepleted,
                };
                (report.position, report.battery, outcome)
            }
            TripSignal::Interrupted { ticks, last_position } => {
                let battery =
                    estimate_battery(scooter.battery_percent, ticks, self.discharge_per_step);
                warn!(scooter_id, ticks, battery, "trip interrupted, closing with estimate");
                (
                    last_position.unwrap_or(start_position),
                    battery,
                    TripOutcome::Interrupted,
                )
            }
        };

        let end = self
            .store
            .record_status_snapshot(scooter_id, end_position, battery)
            .await?;
        let distance = start_position.distance(&end_position);

        let docked_at = (outcome == TripOutcome::Arrived).then_some(station.id);
        self.store
            .update_scooter_status(
                scooter_id,
                ScooterStatusUpdate {
                    position: end_position,
                    battery_percent: battery,
                    station_id: docked_at,
                },
            )
            .await?;

        let order = self
            .store
            .create_order(NewOrder {
                user_id,
                scooter_id,
                status_start_id: start.id,
                status_end_id: end.id,
                distance,
            })
            .await?;

        info!(
            scooter_id,
            order_id = order.id,
            ?outcome,
            distance,
            battery,
            "trip completed"
        );
        Ok(Trip {
            order_id: order.id,
            scooter_id,
            user_id,
            start_snapshot_id: start.id,
            end_snapshot_id: end.id,
            distance,
            outcome,
            battery,
        })
    }

    /// Sends a scooter somewhere outside of any trip.
    pub fn redirect(&self, scooter_id: ScooterId, destination: Position) -> Result<(), TripError> {
        if self.registry.has_active_trip(scooter_id) {
            return Err(TripError::TripInProgress(scooter_id));
        }
        self.registry
            .dispatch(scooter_id, destination, None)
            .map_err(|_| TripError::DeviceUnreachable(scooter_id))
    }
}

fn estimate_battery(start: f64, ticks: u64, discharge_per_step: f64) -> f64 {
    (start - ticks as f64 * discharge_per_step).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::LiveHub;
    use crate::models::{ScooterState, Station};
    use crate::storage::{MemoryStore, OrderStore, ScooterStore};
    use fleet_sim::{TelemetryMessage, TripReport};

    fn fixture(battery: f64) -> (Arc<MemoryStore>, StreamRegistry, TripOrchestrator) {
        let store = Arc::new(MemoryStore::new(
            vec![ScooterState {
                id: 1,
                model: "Ninebot".into(),
                position: Position::new(0.0, 0.0),
                battery_percent: battery,
                station_id: None,
            }],
            vec![Station {
                id: 2,
                name: "Depot".into(),
                is_active: true,
                position: Position::new(0.001, 0.001),
            }],
        ));
        let registry = StreamRegistry::new(LiveHub::new(8));
        let trips = TripOrchestrator::new(
            store.clone(),
            registry.clone(),
            0.1,
            Duration::from_millis(200),
        );
        (store, registry, trips)
    }

    #[test]
    fn test_battery_estimate_never_negative() {
        assert_eq!(estimate_battery(50.0, 10, 1.0), 40.0);
        assert_eq!(estimate_battery(5.0, 10, 1.0), 0.0);
    }

    #[test]
    fn test_idle_timeout_follows_tick_interval() {
        let slow = MotionProfile {
            tick_interval: Duration::from_secs(2),
            ..MotionProfile::default()
        };
        assert_eq!(default_idle_timeout(&slow), Duration::from_secs(40));
        assert_eq!(default_idle_timeout(&MotionProfile::default()), MIN_IDLE_TIMEOUT);
        assert_eq!(default_idle_timeout(&MotionProfile::instant(0.0001, 0.1)), MIN_IDLE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_low_battery_is_not_rentable() {
        let (_store, registry, trips) = fixture(10.0);
        let (_guard, _rx) = registry.register(1).unwrap();
        let err = trips.start_trip(1, 2, 3).await.unwrap_err();
        assert!(matches!(err, TripError::NotRentable { scooter_id: 1, .. }));
        assert_eq!(registry.active_trips(), 0);
    }

    #[tokio::test]
    async fn test_unconnected_scooter_is_unreachable() {
        let (store, _registry, trips) = fixture(80.0);
        let err = trips.start_trip(1, 2, 3).await.unwrap_err();
        assert!(matches!(err, TripError::DeviceUnreachable(1)));
        assert!(store.list_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_station_is_not_found() {
        let (_store, registry, trips) = fixture(80.0);
        let (_guard, _rx) = registry.register(1).unwrap();
        let err = trips.start_trip(1, 99, 3).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reported_trip_becomes_order() {
        let (store, registry, trips) = fixture(80.0);
        let (_guard, mut commands) = registry.register(1).unwrap();

        // stands in for the device: answers the dispatch with a report
        let device = registry.clone();
        tokio::spawn(async move {
            let cmd = commands.recv().await.unwrap();
            device.on_telemetry(TelemetryMessage::new(1, cmd.destination));
            device.on_trip_ended(TripReport {
                scooter_id: 1,
                position: cmd.destination,
                battery: 79.9,
                outcome: Outcome::Arrived,
                trip_id: cmd.trip_id,
            });
            commands
        });

        let trip = trips.start_trip(1, 2, 3).await.unwrap();
        assert_eq!(trip.outcome, TripOutcome::Arrived);
        assert_eq!(trip.battery, 79.9);
        assert!((trip.distance - 0.001414).abs() < 1e-5);

        let scooter = store.get_scooter(1).await.unwrap();
        assert_eq!(scooter.station_id, Some(2));
        assert_eq!(scooter.position, Position::new(0.001, 0.001));
        assert_eq!(store.list_orders().await.unwrap()[0].id, trip.order_id);
    }

    #[tokio::test]
    async fn test_silent_device_times_out_as_interrupted() {
        let (store, registry, trips) = fixture(80.0);
        let (_guard, mut commands) = registry.register(1).unwrap();

        let device = registry.clone();
        tokio::spawn(async move {
            let _cmd = commands.recv().await.unwrap();
            for i in 1..=3 {
                let at = Position::new(0.0001 * f64::from(i), 0.0001 * f64::from(i));
                device.on_telemetry(TelemetryMessage::new(1, at));
            }
            // never reports the end, keep the queue alive
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(commands);
        });

        let trip = trips.start_trip(1, 2, 3).await.unwrap();
        assert_eq!(trip.outcome, TripOutcome::Interrupted);
        assert!((trip.battery - 79.7).abs() < 1e-9);
        let scooter = store.get_scooter(1).await.unwrap();
        assert_eq!(scooter.station_id, None);
        assert!((scooter.position.latitude - 0.0003).abs() < 1e-12);
        assert!(!registry.has_active_trip(1));
    }

    #[tokio::test]
    async fn test_slow_trip_outlives_idle_timeout() {
        let (store, registry, trips) = fixture(80.0);
        let (_guard, mut commands) = registry.register(1).unwrap();

        // 10 samples 40 ms apart: 400 ms of movement, never 200 ms of silence
        let device = registry.clone();
        tokio::spawn(async move {
            let cmd = commands.recv().await.unwrap();
            for step in 1..=10 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                let at = Position::new(0.0001 * f64::from(step), 0.0001 * f64::from(step));
                device.on_telemetry(TelemetryMessage::new(1, at));
            }
            device.on_trip_ended(TripReport {
                scooter_id: 1,
                position: cmd.destination,
                battery: 79.0,
                outcome: Outcome::Arrived,
                trip_id: cmd.trip_id,
            });
            commands
        });

        let trip = trips.start_trip(1, 2, 3).await.unwrap();
        assert_eq!(trip.outcome, TripOutcome::Arrived);
        assert_eq!(trip.battery, 79.0);
        assert!((trip.distance - 0.001414).abs() < 1e-5);
        let scooter = store.get_scooter(1).await.unwrap();
        assert_eq!(scooter.position, Position::new(0.001, 0.001));
        assert_eq!(scooter.station_id, Some(2));
    }

    #[tokio::test]
    async fn test_leftover_redirect_report_does_not_close_trip() {
        let (store, registry, trips) = fixture(80.0);
        let (_guard, mut commands) = registry.register(1).unwrap();

        let device = registry.clone();
        tokio::spawn(async move {
            let cmd = commands.recv().await.unwrap();
            // an earlier raw redirect finishing late
            let leftover = device.on_trip_ended(TripReport {
                scooter_id: 1,
                position: Position::new(9.0, 9.0),
                battery: 1.0,
                outcome: Outcome::Arrived,
                trip_id: None,
            });
            assert!(!leftover);
            device.on_telemetry(TelemetryMessage::new(1, cmd.destination));
            device.on_trip_ended(TripReport {
                scooter_id: 1,
                position: cmd.destination,
                battery: 79.9,
                outcome: Outcome::Arrived,
                trip_id: cmd.trip_id,
            });
            commands
        });

        let trip = trips.start_trip(1, 2, 3).await.unwrap();
        assert_eq!(trip.outcome, TripOutcome::Arrived);
        assert_eq!(trip.battery, 79.9);
        assert!((trip.distance - 0.001414).abs() < 1e-5);
        assert_eq!(store.list_orders().await.unwrap()[0].distance, trip.distance);
    }

    #[tokio::test]
    async fn test_redirect_refused_during_trip() {
        let (_store, registry, trips) = fixture(80.0);
        assert!(matches!(
            trips.redirect(1, Position::new(1.0, 1.0)),
            Err(TripError::DeviceUnreachable(1))
        ));
        let (_guard, mut commands) = registry.register(1).unwrap();
        trips.redirect(1, Position::new(1.0, 1.0)).unwrap();
        assert!(commands.try_recv().is_ok());

        let _ticket = registry.begin_trip(1).unwrap();
        assert!(matches!(
            trips.redirect(1, Position::new(2.0, 2.0)),
            Err(TripError::TripInProgress(1))
        ));
    }
}
