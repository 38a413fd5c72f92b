/*!
Test harness for kernel scenarios

Builds a complete kernel in-process: seeded memory store, live hub, stream
registry, trip orchestrator and embedded devices moving with no tick delay.
*/

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fleet_kernel::config::{KernelConfig, MotionConf};
use fleet_kernel::devices::spawn_embedded_devices;
use fleet_kernel::models::{ScooterState, Station};
use fleet_kernel::mqtt::spawn_telemetry_bridge;
use fleet_kernel::{AppState, MemoryStore};
use fleet_sim::{Position, ScooterId, StationId};
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::mqtt_stub::MockBus;

pub fn scooter(id: ScooterId, latitude: f64, longitude: f64, battery: f64) -> ScooterState {
    ScooterState {
        id,
        model: "Test scooter".into(),
        position: Position::new(latitude, longitude),
        battery_percent: battery,
        station_id: None,
    }
}

pub fn station(id: StationId, name: &str, latitude: f64, longitude: f64) -> Station {
    Station {
        id,
        name: name.into(),
        is_active: true,
        position: Position::new(latitude, longitude),
    }
}

/// Default motion with no delay between steps, short trip idle timeout.
pub fn test_config() -> KernelConfig {
    KernelConfig {
        data_dir: None,
        trip_idle_timeout_secs: Some(5),
        motion: MotionConf {
            tick_interval_ms: 0,
            ..MotionConf::default()
        },
        ..KernelConfig::default()
    }
}

pub struct TestHarness {
    pub app: AppState,
    pub store: Arc<MemoryStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    pub fn new(scooters: Vec<ScooterState>, stations: Vec<Station>) -> Self {
        Self::with_config(KernelConfig {
            scooters,
            stations,
            ..test_config()
        })
    }

    /// Seeds the store from `cfg.scooters` / `cfg.stations` and starts
    /// `cfg.embedded_devices` devices.
    pub fn with_config(cfg: KernelConfig) -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init()
            .ok();

        let store = Arc::new(MemoryStore::new(cfg.scooters.clone(), cfg.stations.clone()));
        let app = AppState::new(store.clone(), &cfg);
        let mut harness = Self {
            app,
            store,
            tasks: Vec::new(),
        };
        if cfg.embedded_devices > 0 {
            harness.spawn_devices(cfg.embedded_devices);
        }
        harness
    }

    pub fn spawn_devices(&mut self, count: usize) {
        let handles = spawn_embedded_devices(
            count,
            &self.app.registry,
            self.app.store.clone(),
            self.app.profile,
        );
        info!(count, "harness devices spawned");
        self.tasks.extend(handles);
    }

    /// Waits until `count` devices hold a scooter slot.
    pub async fn wait_connected(&self, count: usize) -> Result<Vec<ScooterId>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let ids = self.app.registry.connected_ids();
            if ids.len() >= count {
                return Ok(ids);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("only {} of {count} devices connected", ids.len());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Mirrors hub telemetry onto a fresh mock bus.
    pub fn attach_bus(&mut self) -> Arc<MockBus> {
        let bus = Arc::new(MockBus::new());
        self.tasks.push(spawn_telemetry_bridge(&self.app.hub, bus.clone()));
        bus
    }

    /// Starts the periodic health publisher on `bus`.
    pub fn publish_health(&mut self, bus: Arc<MockBus>, period: Duration) {
        let app = self.app.clone();
        self.tasks.push(self.app.health.spawn_health_publisher(bus, app, period));
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_connects_devices_in_slot_order() {
        let mut cfg = test_config();
        cfg.scooters = vec![scooter(3, 0.0, 0.0, 80.0), scooter(1, 0.0, 0.0, 80.0)];
        cfg.embedded_devices = 2;
        let harness = TestHarness::with_config(cfg);

        let ids = harness.wait_connected(2).await.unwrap();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_wait_connected_gives_up() {
        let harness = TestHarness::new(vec![scooter(1, 0.0, 0.0, 80.0)], Vec::new());
        assert!(harness.wait_connected(1).await.is_err());
    }
}
