/**
 * FLEET KERNEL - entry point
 *
 * Boots the whole kernel: config, storage, live hub, stream registry,
 * embedded devices, optional MQTT bridges, then the HTTP/SSE/WS surface.
 */

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_kernel::config::load_config;
use fleet_kernel::devices::spawn_embedded_devices;
use fleet_kernel::health::HEALTH_PERIOD;
use fleet_kernel::{http, mqtt, AppState, MemoryStore};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = load_config().await;
    info!(
        scooters = cfg.scooters.len(),
        stations = cfg.stations.len(),
        embedded = cfg.embedded_devices,
        "fleet kernel starting"
    );

    let mut store = MemoryStore::new(cfg.scooters.clone(), cfg.stations.clone());
    if let Some(dir) = &cfg.data_dir {
        match tokio::fs::create_dir_all(dir).await {
            Ok(()) => {
                store = store.with_persistence(dir);
                if let Err(e) = store.load().await {
                    warn!("failed to load order ledger: {e}");
                }
            }
            Err(e) => warn!(%dir, "cannot create data dir, orders stay in memory: {e}"),
        }
    }

    let app = AppState::new(Arc::new(store), &cfg);

    if let Some(mqtt_cfg) = &cfg.mqtt {
        let bus = Arc::new(mqtt::connect(mqtt_cfg, app.health.clone()));
        mqtt::spawn_telemetry_bridge(&app.hub, bus.clone());
        app.health.spawn_health_publisher(bus, app.clone(), HEALTH_PERIOD);
        info!(host = %mqtt_cfg.host, port = mqtt_cfg.port, "MQTT bridge enabled");
    }

    if cfg.embedded_devices > 0 {
        spawn_embedded_devices(cfg.embedded_devices, &app.registry, app.store.clone(), app.profile);
        info!(count = cfg.embedded_devices, "embedded devices started");
    }

    let api_key = cfg.resolved_api_key();
    if api_key.is_none() {
        warn!("no api key configured, the REST API is open");
    }
    let router = http::build_router(app, api_key);

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("cannot bind {}", cfg.listen))?;
    info!("listening on http://{}", cfg.listen);
    axum::serve(listener, router).await.context("http server failed")?;
    Ok(())
}
