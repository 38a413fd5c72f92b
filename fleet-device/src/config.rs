//! Device configuration: YAML file plus environment overrides.
//!
//! - `FLEET_DEVICE_CONFIG`: path of the YAML file (default `device.yaml`)
//! - `FLEET_KERNEL_URL`: websocket endpoint of the kernel
//! - `FLEET_SCOOTER_ID`: scooter slot to claim (otherwise the first free one)

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_sim::{MotionConf, ScooterId};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub kernel_url: String,
    pub scooter_id: Option<ScooterId>,
    pub reconnect_secs: u64,
    pub handshake_timeout_secs: u64,
    pub motion: MotionConf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kernel_url: "ws://127.0.0.1:8080/devices/ws".to_string(),
            scooter_id: None,
            reconnect_secs: 5,
            handshake_timeout_secs: 10,
            motion: MotionConf::default(),
        }
    }
}

impl DeviceConfig {
    pub fn load() -> Result<Self> {
        let path = std::env::var("FLEET_DEVICE_CONFIG").unwrap_or_else(|_| "device.yaml".into());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.apply_overrides(
            std::env::var("FLEET_KERNEL_URL").ok(),
            std::env::var("FLEET_SCOOTER_ID").ok(),
        )?;
        cfg.motion
            .profile()
            .validate()
            .context("invalid motion settings")?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "no device config, using defaults");
            return Ok(Self::default());
        }
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&txt)
            .with_context(|| format!("invalid device config {}", path.display()))
    }

    fn apply_overrides(&mut self, url: Option<String>, scooter_id: Option<String>) -> Result<()> {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.kernel_url = url;
        }
        if let Some(id) = scooter_id.filter(|s| !s.trim().is_empty()) {
            let id = id
                .trim()
                .parse()
                .with_context(|| format!("FLEET_SCOOTER_ID is not a number: {id}"))?;
            self.scooter_id = Some(id);
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }
}
