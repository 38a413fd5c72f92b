/**
 * LIVE TELEMETRY HUB - fan-out of scooter positions to dashboard viewers
 *
 * Every viewer owns a bounded queue. Publishing never waits: a viewer whose
 * queue is full misses that message, a viewer whose queue is gone is removed.
 * Publishing happens under the viewer-set lock, so all viewers see messages
 * from one scooter in the order they were published.
 */

use std::collections::HashMap;
use std::sync::Arc;

use fleet_sim::TelemetryMessage;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_VIEWER_BUFFER: usize = 64;

#[derive(Default)]
struct HubInner {
    viewers: HashMap<Uuid, mpsc::Sender<TelemetryMessage>>,
    lagged: u64,
}

#[derive(Clone)]
pub struct LiveHub {
    inner: Arc<Mutex<HubInner>>,
    buffer: usize,
}

impl Default for LiveHub {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_BUFFER)
    }
}

impl LiveHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner::default())),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Viewer {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.inner.lock().viewers.insert(id, tx);
        debug!(%id, "viewer subscribed");
        Viewer {
            id,
            receiver: rx,
            hub: self.clone(),
        }
    }

    /// Removes a viewer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.inner.lock().viewers.remove(&id).is_some() {
            debug!(%id, "viewer unsubscribed");
        }
    }

    /// Offers `msg` to every viewer and returns how many accepted it.
    pub fn publish(&self, msg: TelemetryMessage) -> usize {
        let mut inner = self.inner.lock();
        let HubInner { viewers, lagged } = &mut *inner;

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in viewers.iter() {
            match tx.try_send(msg) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => *lagged += 1,
                Err(TrySendError::Closed(_)) => dead.push(*id),
            }
        }
        for id in dead {
            viewers.remove(&id);
            warn!(%id, "dropping unreachable viewer");
        }
        delivered
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.lock().viewers.len()
    }

    /// Messages skipped because a viewer's queue was full.
    pub fn lagged(&self) -> u64 {
        self.inner.lock().lagged
    }
}

/// Dashboard subscription. Dropping it unsubscribes.
pub struct Viewer {
    id: Uuid,
    receiver: mpsc::Receiver<TelemetryMessage>,
    hub: LiveHub,
}

impl Viewer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn recv(&mut self) -> Option<TelemetryMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TelemetryMessage> {
        self.receiver.try_recv().ok()
    }

    /// Stops accepting messages while staying subscribed until the next publish.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}
