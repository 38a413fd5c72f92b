/**
 * STREAM REGISTRY - scooter id -> live device session
 *
 * Single owner of three tables, all behind one lock:
 * - sessions: the one live connection per scooter and its command queue
 * - live: last position reported by each scooter
 * - trips: the trip waiter per scooter, resolved by the device's trip report
 *   carrying the same trip id
 *
 * The lock is never held across an await. A connection keeps its slot
 * through a `Registration` guard that frees the slot on drop, and only ever
 * its own slot, never one a newer connection has taken since.
 */

use std::collections::HashMap;
use std::time::Duration;

use fleet_sim::{DispatchCommand, Position, ScooterId, TelemetryMessage, TripId, TripReport};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RegistryError;
use crate::hub::LiveHub;
use crate::state::{new_state, Shared};

pub type CommandReceiver = mpsc::UnboundedReceiver<DispatchCommand>;

/// Last position seen on a scooter's stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveState {
    pub position: Position,
    pub updated_at: OffsetDateTime,
}

/// How a pending trip was resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TripSignal {
    Ended(TripReport),
    /// The device disconnected or stayed silent. `ticks` counts the telemetry
    /// received since the trip began.
    Interrupted {
        ticks: u64,
        last_position: Option<Position>,
    },
}

struct SessionSlot {
    connection_id: Uuid,
    commands: mpsc::UnboundedSender<DispatchCommand>,
    connected_at: OffsetDateTime,
}

struct PendingTrip {
    trip_id: TripId,
    /// Telemetry count since the trip began; every sample wakes the waiter.
    ticks: watch::Sender<u64>,
    waiter: oneshot::Sender<TripSignal>,
}

impl PendingTrip {
    fn ticks(&self) -> u64 {
        *self.ticks.borrow()
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<ScooterId, SessionSlot>,
    live: HashMap<ScooterId, LiveState>,
    trips: HashMap<ScooterId, PendingTrip>,
}

impl RegistryInner {
    fn last_position(&self, id: ScooterId) -> Option<Position> {
        self.live.get(&id).map(|l| l.position)
    }

    fn drop_session(&mut self, id: ScooterId) -> bool {
        if self.sessions.remove(&id).is_none() {
            return false;
        }
        if let Some(trip) = self.trips.remove(&id) {
            let ticks = trip.ticks();
            let signal = TripSignal::Interrupted {
                ticks,
                last_position: self.last_position(id),
            };
            if trip.waiter.send(signal).is_err() {
                debug!(scooter_id = id, "trip waiter already gone");
            }
            warn!(scooter_id = id, ticks, "session lost mid-trip");
        }
        true
    }
}

#[derive(Clone)]
pub struct StreamRegistry {
    inner: Shared<RegistryInner>,
    hub: LiveHub,
}

impl StreamRegistry {
    pub fn new(hub: LiveHub) -> Self {
        Self {
            inner: new_state(RegistryInner::default()),
            hub,
        }
    }

    pub fn hub(&self) -> &LiveHub {
        &self.hub
    }

    /// Claims the slot for `id`.
    pub fn register(
        &self,
        id: ScooterId,
    ) -> Result<(Registration, CommandReceiver), RegistryError> {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        Ok(self.claim(&mut inner, id))
    }

    /// Claims the first slot in `candidates` that has no live session.
    pub fn register_first_free<I>(
        &self,
        candidates: I,
    ) -> Result<(Registration, CommandReceiver), RegistryError>
    where
        I: IntoIterator<Item = ScooterId>,
    {
        let mut inner = self.inner.lock();
        let id = candidates
            .into_iter()
            .find(|id| !inner.sessions.contains_key(id))
            .ok_or(RegistryError::NoFreeSlot)?;
        Ok(self.claim(&mut inner, id))
    }

    fn claim(&self, inner: &mut RegistryInner, id: ScooterId) -> (Registration, CommandReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        inner.sessions.insert(
            id,
            SessionSlot {
                connection_id,
                commands: tx,
                connected_at: OffsetDateTime::now_utc(),
            },
        );
        info!(scooter_id = id, %connection_id, "session registered");
        let registration = Registration {
            scooter_id: id,
            connection_id,
            registry: self.clone(),
        };
        (registration, rx)
    }

    /// Removes whatever session holds `id`. Returns false if there was none.
    pub fn unregister(&self, id: ScooterId) -> bool {
        let removed = self.inner.lock().drop_session(id);
        if removed {
            info!(scooter_id = id, "session unregistered");
        }
        removed
    }

    fn release(&self, id: ScooterId, connection_id: Uuid) {
        let mut inner = self.inner.lock();
        let owned = inner
            .sessions
            .get(&id)
            .is_some_and(|slot| slot.connection_id == connection_id);
        if owned {
            inner.drop_session(id);
            drop(inner);
            info!(scooter_id = id, %connection_id, "session released");
        }
    }

    /// Queues a dispatch for the device holding `id`. Pass the ticket's trip
    /// id so the device's report can resolve that trip and no other.
    pub fn dispatch(
        &self,
        id: ScooterId,
        destination: Position,
        trip_id: Option<TripId>,
    ) -> Result<(), RegistryError> {
        let inner = self.inner.lock();
        let slot = inner.sessions.get(&id).ok_or(RegistryError::NotRegistered(id))?;
        slot.commands
            .send(DispatchCommand {
                scooter_id: id,
                destination,
                trip_id,
            })
            .map_err(|_| RegistryError::NotRegistered(id))?;
        debug!(
            scooter_id = id,
            lat = destination.latitude,
            lon = destination.longitude,
            ?trip_id,
            "dispatch queued"
        );
        Ok(())
    }

    /// Records a position sample and forwards it to the live hub. Returns the
    /// number of viewers that received it.
    pub fn on_telemetry(&self, msg: TelemetryMessage) -> usize {
        {
            let mut inner = self.inner.lock();
            inner.live.insert(
                msg.scooter_id,
                LiveState {
                    position: msg.position(),
                    updated_at: OffsetDateTime::now_utc(),
                },
            );
            if let Some(trip) = inner.trips.get(&msg.scooter_id) {
                trip.ticks.send_modify(|ticks| *ticks += 1);
            }
        }
        self.hub.publish(msg)
    }

    /// Resolves the pending trip the report belongs to. Reports of raw
    /// redirects or of trips already given up only update the live position.
    /// Returns false when no waiter took the report.
    pub fn on_trip_ended(&self, report: TripReport) -> bool {
        let mut inner = self.inner.lock();
        inner.live.insert(
            report.scooter_id,
            LiveState {
                position: report.position,
                updated_at: OffsetDateTime::now_utc(),
            },
        );
        let matches = report.trip_id.is_some_and(|id| {
            inner
                .trips
                .get(&report.scooter_id)
                .is_some_and(|trip| trip.trip_id == id)
        });
        if !matches {
            debug!(
                scooter_id = report.scooter_id,
                trip_id = ?report.trip_id,
                "trip report without waiter"
            );
            return false;
        }
        let Some(trip) = inner.trips.remove(&report.scooter_id) else {
            return false;
        };
        drop(inner);
        trip.waiter.send(TripSignal::Ended(report)).is_ok()
    }

    /// Claims the trip slot of a connected scooter.
    pub fn begin_trip(&self, id: ScooterId) -> Result<TripTicket, RegistryError> {
        let mut inner = self.inner.lock();
        if !inner.sessions.contains_key(&id) {
            return Err(RegistryError::NotRegistered(id));
        }
        if inner.trips.contains_key(&id) {
            return Err(RegistryError::TripInProgress(id));
        }
        let (tx, rx) = oneshot::channel();
        let (ticks, activity) = watch::channel(0);
        let trip_id = Uuid::new_v4();
        inner.trips.insert(
            id,
            PendingTrip {
                trip_id,
                ticks,
                waiter: tx,
            },
        );
        Ok(TripTicket {
            scooter_id: id,
            trip_id,
            receiver: Some(rx),
            activity,
            registry: self.clone(),
        })
    }

    /// Drops a pending trip if it is still the one identified by `trip_id`.
    fn abandon_trip(&self, id: ScooterId, trip_id: TripId) -> Option<(u64, Option<Position>)> {
        let mut inner = self.inner.lock();
        let current = inner.trips.get(&id).is_some_and(|t| t.trip_id == trip_id);
        if !current {
            return None;
        }
        let trip = inner.trips.remove(&id)?;
        Some((trip.ticks(), inner.last_position(id)))
    }

    pub fn last_known(&self, id: ScooterId) -> Option<LiveState> {
        self.inner.lock().live.get(&id).copied()
    }

    pub fn is_connected(&self, id: ScooterId) -> bool {
        self.inner.lock().sessions.contains_key(&id)
    }

    pub fn connected_since(&self, id: ScooterId) -> Option<OffsetDateTime> {
        self.inner.lock().sessions.get(&id).map(|s| s.connected_at)
    }

    pub fn connected_ids(&self) -> Vec<ScooterId> {
        let mut ids: Vec<ScooterId> = self.inner.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn has_active_trip(&self, id: ScooterId) -> bool {
        self.inner.lock().trips.contains_key(&id)
    }

    pub fn active_trips(&self) -> usize {
        self.inner.lock().trips.len()
    }
}

/// Slot ownership for one connection. Dropping it frees the slot.
pub struct Registration {
    scooter_id: ScooterId,
    connection_id: Uuid,
    registry: StreamRegistry,
}

impl Registration {
    pub fn scooter_id(&self) -> ScooterId {
        self.scooter_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(self.scooter_id, self.connection_id);
    }
}

/// Claim on a scooter's trip slot. Dropping an unresolved ticket frees the slot.
pub struct TripTicket {
    scooter_id: ScooterId,
    trip_id: TripId,
    receiver: Option<oneshot::Receiver<TripSignal>>,
    activity: watch::Receiver<u64>,
    registry: StreamRegistry,
}

impl TripTicket {
    pub fn scooter_id(&self) -> ScooterId {
        self.scooter_id
    }

    pub fn trip_id(&self) -> TripId {
        self.trip_id
    }

    /// Waits for the trip report. Gives up once the scooter has been silent
    /// for `idle_limit`; every telemetry sample restarts that countdown.
    pub async fn wait(mut self, idle_limit: Duration) -> TripSignal {
        let Some(mut receiver) = self.receiver.take() else {
            return self.give_up();
        };
        let mut activity = self.activity.clone();
        loop {
            tokio::select! {
                signal = &mut receiver => {
                    return signal.unwrap_or_else(|_| self.give_up());
                }
                changed = activity.changed() => {
                    if changed.is_err() {
                        // The trip left the registry, its signal is on the way.
                        return match tokio::time::timeout(idle_limit, &mut receiver).await {
                            Ok(Ok(signal)) => signal,
                            _ => self.give_up(),
                        };
                    }
                }
                _ = tokio::time::sleep(idle_limit) => {
                    warn!(
                        scooter_id = self.scooter_id,
                        ?idle_limit,
                        "no telemetry, giving up on trip"
                    );
                    return self.give_up();
                }
            }
        }
    }

    fn give_up(&self) -> TripSignal {
        match self.registry.abandon_trip(self.scooter_id, self.trip_id) {
            Some((ticks, last_position)) => TripSignal::Interrupted { ticks, last_position },
            None => TripSignal::Interrupted {
                ticks: 0,
                last_position: self.registry.last_known(self.scooter_id).map(|l| l.position),
            },
        }
    }
}

impl Drop for TripTicket {
    fn drop(&mut self) {
        self.registry.abandon_trip(self.scooter_id, self.trip_id);
    }
}
