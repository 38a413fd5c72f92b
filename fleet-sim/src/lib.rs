//! Fleet simulation core shared by the kernel and the scooter devices.
//!
//! - `engine` : stepwise movement + battery discharge toward a destination
//! - `protocol` : frames exchanged on the device <-> kernel duplex channel
//! - `link` : transport-agnostic frame sink/source halves (+ in-memory pair)
//! - `session` : one scooter's device-side state machine driving the engine

pub mod engine;
pub mod error;
pub mod link;
pub mod position;
pub mod protocol;
pub mod session;

pub use engine::{MotionConf, MotionProfile, Outcome, Sample, Simulation};
pub use error::{LinkError, SessionError, SimError};
pub use link::{FrameSink, FrameSource};
pub use position::Position;
pub use protocol::{
    DeviceFrame, DeviceState, DispatchCommand, ScooterId, ServerFrame, StationId, TelemetryMessage,
    TripId, TripReport, UserId,
};
pub use session::{DeviceSession, SessionEnd};
