//! Frames exchanged between a scooter device and the fleet kernel.
//!
//! Everything is JSON, tagged by a `type` field, one frame per message.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Outcome;
use crate::position::Position;

pub type ScooterId = u64;
pub type StationId = u64;
pub type UserId = u64;
/// Identifies one dispatched trip; echoed back in the trip report.
pub type TripId = Uuid;

/// Latest position reported by a moving scooter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    pub scooter_id: ScooterId,
    pub latitude: f64,
    pub longitude: f64,
}

impl TelemetryMessage {
    pub fn new(scooter_id: ScooterId, position: Position) -> Self {
        Self {
            scooter_id,
            latitude: position.latitude,
            longitude: position.longitude,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.latitude, self.longitude)
    }
}

/// Order to drive a scooter to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub scooter_id: ScooterId,
    pub destination: Position,
    /// Absent for raw redirects that no trip is waiting on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<TripId>,
}

/// Where a device stands when it is (re)attached.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub position: Position,
    pub battery: f64,
}

/// Final state of a trip as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripReport {
    pub scooter_id: ScooterId,
    pub position: Position,
    pub battery: f64,
    pub outcome: Outcome,
    /// Trip id of the dispatch that started this movement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<TripId>,
}

/// Device to kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceFrame {
    /// First frame on a connection. `None` asks for any free scooter slot.
    Hello { scooter_id: Option<ScooterId> },
    Telemetry(TelemetryMessage),
    TripEnded(TripReport),
}

/// Kernel to device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        scooter_id: ScooterId,
        state: DeviceState,
    },
    Dispatch(DispatchCommand),
    Rejected { reason: String },
}
