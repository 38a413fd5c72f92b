use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::{self, JoinHandle};
use tracing::{debug, warn};

use crate::mqtt::{BusPublisher, HEALTH_TOPIC};
use crate::state::AppState;

pub const HEALTH_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub scooters_tracked: u32,
    pub devices_connected: u32,
    pub active_trips: u32,
    pub live_viewers: u32,
    pub telemetry_lagged: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub async fn get_health(&self, app: &AppState) -> KernelHealth {
        let scooters = match app.store.list_scooters().await {
            Ok(list) => list.len() as u32,
            Err(e) => {
                warn!("health: cannot list scooters: {e}");
                0
            }
        };
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            scooters_tracked: scooters,
            devices_connected: app.registry.connected_ids().len() as u32,
            active_trips: app.registry.active_trips() as u32,
            live_viewers: app.hub.viewer_count() as u32,
            telemetry_lagged: app.hub.lagged(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Publishes kernel health on the bus every `period`.
    pub fn spawn_health_publisher<P>(
        &self,
        bus: Arc<P>,
        app: AppState,
        period: Duration,
    ) -> JoinHandle<()>
    where
        P: BusPublisher + ?Sized + 'static,
    {
        let tracker = self.clone();
        task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&app).await;
                let Ok(payload) = serde_json::to_string(&health) else {
                    continue;
                };
                match bus.publish_json(HEALTH_TOPIC, payload).await {
                    Ok(()) => debug!(
                        uptime = health.uptime_seconds,
                        devices = health.devices_connected,
                        "published kernel health"
                    ),
                    Err(e) => warn!("health publish failed: {e}"),
                }
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
