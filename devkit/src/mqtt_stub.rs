/*!
Mock bus publisher for tests without a broker

Records every message the kernel bridges publish so tests can assert on
topics and JSON payloads. Can be switched to failing mode to exercise the
bridges' error paths.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleet_kernel::error::BusError;
use fleet_kernel::mqtt::BusPublisher;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Clone, Default)]
pub struct MockBus {
    published: Arc<Mutex<Vec<BusMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// While failing, publishes are still recorded but report an error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn published_messages(&self) -> Vec<BusMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<BusMessage> {
        self.published
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn json_messages<T: DeserializeOwned>(&self, topic: &str) -> Result<Vec<T>> {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|msg| serde_json::from_str(&msg.payload).map_err(Into::into))
            .collect()
    }

    pub fn last_json_message<T: DeserializeOwned>(&self, topic: &str) -> Result<Option<T>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_str(&msg.payload)?)),
            None => Ok(None),
        }
    }

    /// Polls until `count` messages were published on `topic`.
    pub async fn wait_for(&self, topic: &str, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.find_messages_by_topic(topic).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl BusPublisher for MockBus {
    async fn publish_json(&self, topic: &str, payload: String) -> Result<(), BusError> {
        debug!(topic, bytes = payload.len(), "[mock] published");
        self.published.lock().push(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        if self.failing.load(Ordering::Relaxed) {
            return Err(BusError("mock bus failing".into()));
        }
        Ok(())
    }
}
