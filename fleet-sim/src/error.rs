use thiserror::Error;

use crate::protocol::ScooterId;

/// Rejected inputs to the movement engine.
#[derive(Debug, Error, PartialEq)]
pub enum SimError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Failures of one half of a duplex link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("frame encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The duplex handle failed mid-session; the in-flight simulation is gone.
    #[error("stream broken for scooter {scooter_id}: {source}")]
    StreamBroken {
        scooter_id: ScooterId,
        #[source]
        source: LinkError,
    },
    #[error("kernel rejected the device: {0}")]
    Rejected(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error(transparent)]
    Simulation(#[from] SimError),
}
