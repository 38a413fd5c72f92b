use axum::http::StatusCode;
use fleet_sim::{LinkError, ScooterId, StationId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("scooter {0} already has a live session")]
    AlreadyRegistered(ScooterId),
    #[error("scooter {0} has no live session")]
    NotRegistered(ScooterId),
    #[error("scooter {0} is already on a trip")]
    TripInProgress(ScooterId),
    #[error("every scooter slot is taken")]
    NoFreeSlot,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("scooter {0} not found")]
    ScooterNotFound(ScooterId),
    #[error("station {0} not found")]
    StationNotFound(StationId),
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TripError {
    #[error("scooter {scooter_id} is not rentable (battery {battery}%)")]
    NotRentable { scooter_id: ScooterId, battery: f64 },
    #[error("scooter {0} is not connected")]
    DeviceUnreachable(ScooterId),
    #[error("scooter {0} is already on a trip")]
    TripInProgress(ScooterId),
    /// Failure talking to storage. Past the dispatch step the scooter has
    /// already moved and nothing is rolled back.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl TripError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TripError::NotRentable { .. } | TripError::TripInProgress(_) => StatusCode::CONFLICT,
            TripError::DeviceUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TripError::Storage(StoreError::ScooterNotFound(_) | StoreError::StationNotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            TripError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Why a device connection was refused or torn down.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device did not say hello")]
    NoHello,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Error)]
#[error("bus publish failed: {0}")]
pub struct BusError(pub String);
