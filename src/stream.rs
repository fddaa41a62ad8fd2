//! Snapshot subscription hub.
//!
//! Subscribers register by test id and receive a `TestStatusUpdate` every
//! publication tick. Per-subscriber buffers are bounded: a slow subscriber
//! observes a lag gap instead of back-pressuring the metrics engine or the
//! publisher. Transport (WebSocket, SSE) is a caller concern; the hub is
//! the API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::metrics::MetricsSnapshot;
use crate::runner::TestPhase;

/// Frames buffered per subscriber before the oldest are dropped.
const SUBSCRIBER_BUFFER: usize = 64;

/// One published frame: where the test is and what it has measured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatusUpdate {
    pub test_id: String,
    pub phase: TestPhase,
    pub snapshot: MetricsSnapshot,
}

/// Fan-out of per-test status updates. Cheap to clone; clones share the
/// channel table.
#[derive(Clone, Default)]
pub struct SnapshotHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<TestStatusUpdate>>>>,
}

impl SnapshotHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a test's updates. The channel is created on first use,
    /// so subscribing before the test starts is valid.
    pub fn subscribe(&self, test_id: &str) -> broadcast::Receiver<TestStatusUpdate> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(test_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    /// Publish one frame. Without subscribers this is a cheap no-op.
    pub fn publish(&self, update: TestStatusUpdate) {
        let sender = {
            let channels = self.channels.lock().unwrap();
            channels.get(&update.test_id).cloned()
        };
        if let Some(sender) = sender {
            // Send fails only when no receiver is attached; that's fine.
            let _ = sender.send(update);
        }
    }

    /// Drop a test's channel once the test record is evicted.
    pub fn remove(&self, test_id: &str) {
        let mut channels = self.channels.lock().unwrap();
        if channels.remove(test_id).is_some() {
            debug!(test_id = test_id, "Removed snapshot channel");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}
