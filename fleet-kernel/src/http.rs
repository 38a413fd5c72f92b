/**
 * FLEET REST API - HTTP surface of the kernel
 *
 * ROUTES:
 * - /health, /system/health : liveness and kernel health
 * - /scooters, /scooters/{id}, /stations : fleet state (stored + live)
 * - POST /trips : rent a scooter and ride it to a station
 * - POST /scooters/{id}/dispatch : raw redirect outside of any trip
 * - /orders : orders created so far
 * - /live : server-sent events, one `telemetry` event per position sample
 * - /devices/ws : websocket device channel
 *
 * SECURITY:
 * When an api key is configured, every route except /health, /live and
 * /devices/ws requires a matching `x-api-key` header.
 */

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_sim::{Position, ScooterId, StationId, UserId};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, warn};

use crate::devices::serve_device;
use crate::error::{StoreError, TripError};
use crate::health::KernelHealth;
use crate::models::{Order, ScooterState, ScooterView, Station, Trip};
use crate::registry::StreamRegistry;
use crate::state::AppState;
use crate::ws as device_ws;

#[derive(Debug, Deserialize)]
pub struct StartTripRequest {
    pub scooter_id: ScooterId,
    pub station_id: StationId,
    pub user_id: UserId,
}

type ApiKey = Option<Arc<str>>;

pub fn build_router(app_state: AppState, api_key: Option<String>) -> Router {
    let api_key: ApiKey = api_key.map(Arc::from);
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/scooters", get(list_scooters))
        .route("/scooters/{id}", get(get_scooter))
        .route("/scooters/{id}/dispatch", post(dispatch_scooter))
        .route("/stations", get(list_stations))
        .route("/trips", post(start_trip))
        .route("/orders", get(list_orders))
        .route("/live", get(live_feed))
        .route("/devices/ws", get(device_socket))
        .with_state(app_state)
        .layer(middleware::from_fn_with_state(api_key, require_api_key))
}

async fn require_api_key(
    State(expected): State<ApiKey>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = expected else {
        return Ok(next.run(req).await);
    };

    let path = req.uri().path();
    if matches!(path, "/health" | "/live" | "/devices/ws") {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == &*expected);
    if !ok {
        warn!(path, "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

impl IntoResponse for TripError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        TripError::Storage(self).into_response()
    }
}

fn to_view(registry: &StreamRegistry, state: ScooterState) -> ScooterView {
    let live = registry.last_known(state.id);
    ScooterView {
        rentable: state.is_rentable(),
        connected: registry.is_connected(state.id),
        in_trip: registry.has_active_trip(state.id),
        live_position: live.map(|l| l.position),
        last_seen: live.and_then(|l| l.updated_at.format(&Rfc3339).ok()),
        connected_since: registry
            .connected_since(state.id)
            .and_then(|at| at.format(&Rfc3339).ok()),
        state,
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.get_health(&app).await)
}

// GET /scooters
async fn list_scooters(State(app): State<AppState>) -> Result<Json<Vec<ScooterView>>, StoreError> {
    let scooters = app.store.list_scooters().await?;
    Ok(Json(
        scooters
            .into_iter()
            .map(|s| to_view(&app.registry, s))
            .collect(),
    ))
}

// GET /scooters/{id}
async fn get_scooter(
    State(app): State<AppState>,
    Path(id): Path<ScooterId>,
) -> Result<Json<ScooterView>, StoreError> {
    let scooter = app.store.get_scooter(id).await?;
    Ok(Json(to_view(&app.registry, scooter)))
}

// POST /scooters/{id}/dispatch
async fn dispatch_scooter(
    State(app): State<AppState>,
    Path(id): Path<ScooterId>,
    Json(destination): Json<Position>,
) -> Result<Response, TripError> {
    if !destination.is_finite() {
        let body = Json(json!({ "error": "destination must be finite" }));
        return Ok((StatusCode::BAD_REQUEST, body).into_response());
    }
    app.store.get_scooter(id).await?;
    app.trips.redirect(id, destination)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true, "scooter_id": id }))).into_response())
}

// GET /stations
async fn list_stations(State(app): State<AppState>) -> Result<Json<Vec<Station>>, StoreError> {
    Ok(Json(app.store.list_stations().await?))
}

// POST /trips
async fn start_trip(
    State(app): State<AppState>,
    Json(req): Json<StartTripRequest>,
) -> Result<(StatusCode, Json<Trip>), TripError> {
    let trip = app
        .trips
        .start_trip(req.scooter_id, req.station_id, req.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(trip)))
}

// GET /orders
async fn list_orders(State(app): State<AppState>) -> Result<Json<Vec<Order>>, StoreError> {
    Ok(Json(app.store.list_orders().await?))
}

// GET /live
async fn live_feed(
    State(app): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let viewer = app.hub.subscribe();
    debug!(viewer = %viewer.id(), "live viewer connected");
    let events = stream::unfold(viewer, |mut viewer| async move {
        let msg = viewer.recv().await?;
        let event = Event::default()
            .event("telemetry")
            .json_data(msg)
            .unwrap_or_else(|e| Event::default().comment(format!("encode error: {e}")));
        Some((Ok(event), viewer))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

// GET /devices/ws
async fn device_socket(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (mut sink, mut source) = device_ws::split(socket);
        let served = serve_device(&app.registry, app.store.as_ref(), &mut sink, &mut source).await;
        if let Err(e) = served {
            debug!("device socket closed: {e}");
        }
        sink.close().await;
    })
}
