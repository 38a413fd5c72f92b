//! Fleet kernel: owns device streams, fans telemetry out to viewers and turns
//! rentals into trips and orders.

pub mod config;
pub mod devices;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod models;
pub mod mqtt;
pub mod registry;
pub mod state;
pub mod storage;
pub mod trips;
pub mod ws;

pub use error::{DeviceError, RegistryError, StoreError, TripError};
pub use hub::{LiveHub, Viewer};
pub use registry::{StreamRegistry, TripSignal};
pub use state::AppState;
pub use storage::{FleetStore, MemoryStore};
pub use trips::TripOrchestrator;
