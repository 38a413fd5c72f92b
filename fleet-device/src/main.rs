//! Fleet Device - standalone simulated scooter
//!
//! Connects to the fleet kernel over WebSocket, claims a scooter slot and
//! then streams one telemetry frame per movement step whenever the kernel
//! dispatches it somewhere. The link is re-established after failures until
//! the battery runs out or the process is interrupted.

mod config;
mod link;

use anyhow::Result;
use config::DeviceConfig;
use fleet_sim::{DeviceSession, SessionEnd, SessionError};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// What to do once a connection is over.
enum Next {
    Reconnect,
    Stop,
}

struct Device {
    config: DeviceConfig,
}

impl Device {
    fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    async fn run(&self) -> Result<()> {
        info!(
            url = %self.config.kernel_url,
            scooter_id = ?self.config.scooter_id,
            "fleet device starting"
        );
        loop {
            match self.connect_once().await {
                Next::Stop => return Ok(()),
                Next::Reconnect => {
                    let delay = self.config.reconnect_delay();
                    info!("reconnecting in {}s", delay.as_secs());
                    sleep(delay).await;
                }
            }
        }
    }

    /// One connection lifetime: connect, handshake, drive the session.
    async fn connect_once(&self) -> Next {
        let (mut sink, mut source) = match link::connect(&self.config.kernel_url).await {
            Ok(halves) => halves,
            Err(e) => {
                warn!("kernel unreachable: {e}");
                return Next::Reconnect;
            }
        };

        let handshake = DeviceSession::handshake(
            &mut sink,
            &mut source,
            self.config.scooter_id,
            self.config.motion.profile(),
        );
        let session = match timeout(self.config.handshake_timeout(), handshake).await {
            Ok(Ok(session)) => session,
            Ok(Err(SessionError::Rejected(reason))) => {
                warn!(%reason, "kernel rejected the device");
                return Next::Reconnect;
            }
            Ok(Err(e)) => {
                warn!("handshake failed: {e}");
                return Next::Reconnect;
            }
            Err(_) => {
                warn!("no welcome from kernel");
                sink.close().await;
                return Next::Reconnect;
            }
        };
        let scooter_id = session.scooter_id();

        let next = tokio::select! {
            end = session.run(&mut sink, &mut source) => match end {
                Ok(SessionEnd::Discharged) => {
                    info!(scooter_id, "battery empty, shutting down");
                    Next::Stop
                }
                Ok(SessionEnd::Closed) => {
                    info!(scooter_id, "kernel closed the session");
                    Next::Reconnect
                }
                Err(e) => {
                    error!(scooter_id, "session failed: {e}");
                    Next::Reconnect
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!(scooter_id, "interrupted");
                Next::Stop
            }
        };
        sink.close().await;
        next
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DeviceConfig::load()?;
    Device::new(config).run().await
}
