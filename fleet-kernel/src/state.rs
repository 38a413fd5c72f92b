use std::sync::Arc;

use fleet_sim::MotionProfile;
use parking_lot::Mutex;

use crate::config::KernelConfig;
use crate::health::HealthTracker;
use crate::hub::LiveHub;
use crate::registry::StreamRegistry;
use crate::storage::FleetStore;
use crate::trips::TripOrchestrator;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Services shared by the HTTP surface, the device gateway and the bridges.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn FleetStore>,
    pub hub: LiveHub,
    pub registry: StreamRegistry,
    pub trips: TripOrchestrator,
    pub health: HealthTracker,
    /// Motion used by embedded devices.
    pub profile: MotionProfile,
}

impl AppState {
    pub fn new(store: Arc<dyn FleetStore>, cfg: &KernelConfig) -> Self {
        let profile = cfg.motion.profile();
        let hub = LiveHub::new(cfg.viewer_buffer);
        let registry = StreamRegistry::new(hub.clone());
        let trips = TripOrchestrator::new(
            store.clone(),
            registry.clone(),
            profile.discharge_per_step,
            cfg.trip_idle_timeout(),
        );
        Self {
            store,
            hub,
            registry,
            trips,
            health: HealthTracker::new(),
            profile,
        }
    }
}
