/**
 * STORAGE - narrow collaborator interfaces for fleet data
 *
 * The kernel only needs to read scooters and stations, write a scooter's
 * status after a trip, record status snapshots and create orders. Any backend
 * implementing these traits can be plugged in; `MemoryStore` keeps everything
 * in memory and optionally mirrors orders and snapshots to a JSON file.
 */

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fleet_sim::{Position, ScooterId, StationId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::{
    NewOrder, Order, ScooterState, ScooterStatusUpdate, Station, TripStatusSnapshot,
};

#[async_trait]
pub trait ScooterStore: Send + Sync {
    async fn get_scooter(&self, id: ScooterId) -> Result<ScooterState, StoreError>;
    async fn list_scooters(&self) -> Result<Vec<ScooterState>, StoreError>;
    async fn get_station(&self, id: StationId) -> Result<Station, StoreError>;
    async fn list_stations(&self) -> Result<Vec<Station>, StoreError>;
    async fn update_scooter_status(
        &self,
        id: ScooterId,
        update: ScooterStatusUpdate,
    ) -> Result<ScooterState, StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError>;
    async fn list_orders(&self) -> Result<Vec<Order>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn record_status_snapshot(
        &self,
        scooter_id: ScooterId,
        position: Position,
        battery: f64,
    ) -> Result<TripStatusSnapshot, StoreError>;
}

/// Everything the kernel needs from storage.
pub trait FleetStore: ScooterStore + OrderStore + SnapshotStore {}

impl<T: ScooterStore + OrderStore + SnapshotStore> FleetStore for T {}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    orders: Vec<Order>,
    snapshots: Vec<TripStatusSnapshot>,
}

impl Ledger {
    fn next_order_id(&self) -> u64 {
        self.orders.last().map_or(1, |o| o.id + 1)
    }

    fn next_snapshot_id(&self) -> u64 {
        self.snapshots.last().map_or(1, |s| s.id + 1)
    }
}

pub struct MemoryStore {
    scooters: Mutex<BTreeMap<ScooterId, ScooterState>>,
    stations: BTreeMap<StationId, Station>,
    ledger: Mutex<Ledger>,
    data_file: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(scooters: Vec<ScooterState>, stations: Vec<Station>) -> Self {
        Self {
            scooters: Mutex::new(scooters.into_iter().map(|s| (s.id, s)).collect()),
            stations: stations.into_iter().map(|s| (s.id, s)).collect(),
            ledger: Mutex::new(Ledger::default()),
            data_file: None,
        }
    }

    /// Mirrors orders and snapshots to `<data_dir>/orders.json`.
    pub fn with_persistence(mut self, data_dir: impl AsRef<Path>) -> Self {
        self.data_file = Some(data_dir.as_ref().join("orders.json"));
        self
    }

    /// Loads a previously saved ledger. Returns the number of orders restored.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(0);
        };
        if !path.exists() {
            info!(path = %path.display(), "no existing order ledger, starting fresh");
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let ledger: Ledger = serde_json::from_str(&content)?;
        let count = ledger.orders.len();
        *self.ledger.lock() = ledger;
        info!(path = %path.display(), orders = count, "order ledger loaded");
        Ok(count)
    }

    async fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.data_file else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&*self.ledger.lock())?;
        tokio::fs::write(path, content).await?;
        debug!(path = %path.display(), "order ledger saved");
        Ok(())
    }
}

#[async_trait]
impl ScooterStore for MemoryStore {
    async fn get_scooter(&self, id: ScooterId) -> Result<ScooterState, StoreError> {
        self.scooters
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ScooterNotFound(id))
    }

    async fn list_scooters(&self) -> Result<Vec<ScooterState>, StoreError> {
        Ok(self.scooters.lock().values().cloned().collect())
    }

    async fn get_station(&self, id: StationId) -> Result<Station, StoreError> {
        self.stations
            .get(&id)
            .cloned()
            .ok_or(StoreError::StationNotFound(id))
    }

    async fn list_stations(&self) -> Result<Vec<Station>, StoreError> {
        Ok(self.stations.values().cloned().collect())
    }

    async fn update_scooter_status(
        &self,
        id: ScooterId,
        update: ScooterStatusUpdate,
    ) -> Result<ScooterState, StoreError> {
        let mut scooters = self.scooters.lock();
        let scooter = scooters.get_mut(&id).ok_or(StoreError::ScooterNotFound(id))?;
        scooter.position = update.position;
        scooter.battery_percent = update.battery_percent.clamp(0.0, 100.0);
        scooter.station_id = update.station_id;
        Ok(scooter.clone())
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create_order(&self, order: NewOrder) -> Result<Order, StoreError> {
        let created = {
            let mut ledger = self.ledger.lock();
            let created = Order {
                id: ledger.next_order_id(),
                user_id: order.user_id,
                scooter_id: order.scooter_id,
                status_start_id: order.status_start_id,
                status_end_id: order.status_end_id,
                distance: order.distance,
                created_at: OffsetDateTime::now_utc(),
            };
            ledger.orders.push(created.clone());
            created
        };
        self.save().await?;
        Ok(created)
    }

    async fn list_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self.ledger.lock().orders.clone())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn record_status_snapshot(
        &self,
        scooter_id: ScooterId,
        position: Position,
        battery: f64,
    ) -> Result<TripStatusSnapshot, StoreError> {
        let snapshot = {
            let mut ledger = self.ledger.lock();
            let snapshot = TripStatusSnapshot {
                id: ledger.next_snapshot_id(),
                scooter_id,
                position,
                battery,
                timestamp: OffsetDateTime::now_utc(),
            };
            ledger.snapshots.push(snapshot.clone());
            snapshot
        };
        self.save().await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(
            vec![ScooterState {
                id: 1,
                model: "E-Twow".into(),
                position: Position::new(0.0, 0.0),
                battery_percent: 80.0,
                station_id: Some(10),
            }],
            vec![Station {
                id: 10,
                name: "Central".into(),
                is_active: true,
                position: Position::new(0.001, 0.001),
            }],
        )
    }

    #[tokio::test]
    async fn test_lookup_and_missing_ids() {
        let store = store();
        assert_eq!(store.get_scooter(1).await.unwrap().model, "E-Twow");
        assert!(matches!(store.get_scooter(2).await, Err(StoreError::ScooterNotFound(2))));
        assert_eq!(store.get_station(10).await.unwrap().name, "Central");
        assert!(matches!(store.get_station(11).await, Err(StoreError::StationNotFound(11))));
    }

    #[tokio::test]
    async fn test_status_update_clamps_battery() {
        let store = store();
        let updated = store
            .update_scooter_status(
                1,
                ScooterStatusUpdate {
                    position: Position::new(0.5, 0.5),
                    battery_percent: -3.0,
                    station_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.battery_percent, 0.0);
        assert_eq!(updated.station_id, None);
        assert!(!updated.is_rentable());
        assert_eq!(store.get_scooter(1).await.unwrap().position, Position::new(0.5, 0.5));
    }

    #[tokio::test]
    async fn test_ids_are_sequential() {
        let store = store();
        let a = store.record_status_snapshot(1, Position::new(0.0, 0.0), 80.0).await.unwrap();
        let b = store.record_status_snapshot(1, Position::new(0.1, 0.0), 79.0).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));

        let order = store
            .create_order(NewOrder {
                user_id: 3,
                scooter_id: 1,
                status_start_id: a.id,
                status_end_id: b.id,
                distance: 0.1,
            })
            .await
            .unwrap();
        assert_eq!(order.id, 1);
        assert_eq!(store.list_orders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = store().with_persistence(dir.path());
        let start = first.record_status_snapshot(1, Position::new(0.0, 0.0), 80.0).await.unwrap();
        let end = first.record_status_snapshot(1, Position::new(0.001, 0.001), 79.0).await.unwrap();
        first
            .create_order(NewOrder {
                user_id: 9,
                scooter_id: 1,
                status_start_id: start.id,
                status_end_id: end.id,
                distance: 0.0014,
            })
            .await
            .unwrap();
        assert!(dir.path().join("orders.json").exists());

        let second = store().with_persistence(dir.path());
        assert_eq!(second.load().await.unwrap(), 1);
        let orders = second.list_orders().await.unwrap();
        assert_eq!(orders[0].user_id, 9);
        let next = second.record_status_snapshot(1, Position::new(0.0, 0.0), 79.0).await.unwrap();
        assert_eq!(next.id, 3);
    }

    #[tokio::test]
    async fn test_load_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persisted = store().with_persistence(dir.path());
        assert_eq!(persisted.load().await.unwrap(), 0);
        assert!(persisted.list_orders().await.unwrap().is_empty());
        assert_eq!(store().load().await.unwrap(), 0);
    }
}
