use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tokio::fs;
use tracing::warn;

pub use fleet_sim::engine::MotionConf;

use crate::hub::DEFAULT_VIEWER_BUFFER;
use crate::models::{ScooterState, Station};
use crate::trips::default_idle_timeout;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    /// Shared key expected in `x-api-key`. No key means an open API.
    pub api_key: Option<String>,
    pub data_dir: Option<String>,
    /// Simulated devices run inside the kernel process.
    pub embedded_devices: usize,
    /// Telemetry silence that ends a trip. Unset scales with `motion.tick_interval_ms`.
    pub trip_idle_timeout_secs: Option<u64>,
    pub viewer_buffer: usize,
    pub motion: MotionConf,
    pub mqtt: Option<MqttConf>,
    pub scooters: Vec<ScooterState>,
    pub stations: Vec<Station>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            api_key: None,
            data_dir: Some("./data".into()),
            embedded_devices: 0,
            trip_idle_timeout_secs: None,
            viewer_buffer: DEFAULT_VIEWER_BUFFER,
            motion: MotionConf::default(),
            mqtt: None,
            scooters: Vec::new(),
            stations: Vec::new(),
        }
    }
}

impl KernelConfig {
    pub fn trip_idle_timeout(&self) -> Duration {
        match self.trip_idle_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => default_idle_timeout(&self.motion.profile()),
        }
    }

    /// `FLEET_API_KEY` wins over the file. Empty values disable the gate.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var("FLEET_API_KEY")
            .ok()
            .or_else(|| self.api_key.clone())
            .filter(|k| !k.trim().is_empty())
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEET_KERNEL_CONFIG").unwrap_or_else(|_| "fleet.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> KernelConfig {
    if !path.exists() {
        warn!(path = %path.display(), "no kernel config, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    let cfg: KernelConfig = serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), "invalid kernel config: {e}");
        KernelConfig::default()
    });
    if let Err(e) = cfg.motion.profile().validate() {
        warn!("invalid motion settings ({e}), using defaults");
        return KernelConfig {
            motion: MotionConf::default(),
            ..cfg
        };
    }
    cfg
}
