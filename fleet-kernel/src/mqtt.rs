use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::MqttConf;
use crate::error::BusError;
use crate::health::HealthTracker;
use crate::hub::LiveHub;

pub const TELEMETRY_TOPIC: &str = "fleet/scooters/telemetry@v1";
pub const HEALTH_TOPIC: &str = "fleet/kernel/health@v1";

/// Outbound side of the event bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish_json(&self, topic: &str, payload: String) -> Result<(), BusError>;
}

#[async_trait]
impl BusPublisher for AsyncClient {
    async fn publish_json(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError(e.to_string()))
    }
}

/// Creates the kernel's broker client and keeps its event loop running.
/// Broker trouble is only reflected in health, never in the core.
pub fn connect(cfg: &MqttConf, health: HealthTracker) -> AsyncClient {
    let mut opts = MqttOptions::new("fleet-kernel", cfg.host.clone(), cfg.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 64);
    health.mark_mqtt_connecting();

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    health.mark_mqtt_connected();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT error: {e:?}");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
    client
}

/// Mirrors every telemetry message published on the hub to the bus.
pub fn spawn_telemetry_bridge<P>(hub: &LiveHub, bus: Arc<P>) -> JoinHandle<()>
where
    P: BusPublisher + ?Sized + 'static,
{
    let mut viewer = hub.subscribe();
    task::spawn(async move {
        while let Some(msg) = viewer.recv().await {
            let payload = match serde_json::to_string(&msg) {
                Ok(p) => p,
                Err(e) => {
                    warn!("cannot encode telemetry: {e}");
                    continue;
                }
            };
            if let Err(e) = bus.publish_json(TELEMETRY_TOPIC, payload).await {
                debug!(scooter_id = msg.scooter_id, "telemetry mirror failed: {e}");
            }
        }
    })
}
