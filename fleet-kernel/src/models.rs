use fleet_sim::{Position, ScooterId, StationId, UserId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A scooter is rentable strictly above this charge.
pub const RENTABLE_BATTERY_THRESHOLD: f64 = 10.0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ScooterState {
    pub id: ScooterId,
    #[serde(default)]
    pub model: String,
    pub position: Position,
    pub battery_percent: f64,
    #[serde(default)]
    pub station_id: Option<StationId>,
}

impl ScooterState {
    pub fn is_rentable(&self) -> bool {
        self.battery_percent > RENTABLE_BATTERY_THRESHOLD
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Station {
    pub id: StationId,
    pub name: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub position: Position,
}

fn default_active() -> bool {
    true
}

/// New stored status for a scooter once a trip is over.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScooterStatusUpdate {
    pub position: Position,
    pub battery_percent: f64,
    /// Destination station on arrival, `None` when the scooter stopped elsewhere.
    pub station_id: Option<StationId>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TripStatusSnapshot {
    pub id: u64,
    pub scooter_id: ScooterId,
    pub position: Position,
    pub battery: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub scooter_id: ScooterId,
    pub status_start_id: u64,
    pub status_end_id: u64,
    pub distance: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Order {
    pub id: u64,
    pub user_id: UserId,
    pub scooter_id: ScooterId,
    pub status_start_id: u64,
    pub status_end_id: u64,
    pub distance: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TripOutcome {
    Arrived,
    /// Battery ran out before the destination. Still a completed trip.
    BatteryDepleted,
    /// Device vanished or stayed silent past the trip timeout.
    Interrupted,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Trip {
    pub order_id: u64,
    pub scooter_id: ScooterId,
    pub user_id: UserId,
    pub start_snapshot_id: u64,
    pub end_snapshot_id: u64,
    pub distance: f64,
    pub outcome: TripOutcome,
    /// Battery percent at the end of the trip.
    pub battery: f64,
}

/// Scooter as shown by the API: stored status plus whatever the live stream knows.
#[derive(Debug, Serialize, Clone)]
pub struct ScooterView {
    #[serde(flatten)]
    pub state: ScooterState,
    pub rentable: bool,
    pub connected: bool,
    pub in_trip: bool,
    pub live_position: Option<Position>,
    pub last_seen: Option<String>,
    /// When the current device session began, RFC 3339.
    pub connected_since: Option<String>,
}
