//! Snapshot update broadcaster for live progress streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::progress::SyncSnapshot;
use crate::registry::SubscriptionStatus;

/// A published change of one subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpdate {
    /// Subscription key, e.g. a source connection id.
    pub key: String,
    /// Run the subscription is watching.
    pub stream_id: String,
    /// Status after the change. `Removed` is the final update for a key.
    pub status: SubscriptionStatus,
    /// Snapshot after the change.
    pub snapshot: SyncSnapshot,
    /// When the update was published.
    pub timestamp: DateTime<Utc>,
}

impl SnapshotUpdate {
    pub fn new(key: &str, stream_id: &str, status: SubscriptionStatus, snapshot: SyncSnapshot) -> Self {
        Self {
            key: key.to_string(),
            stream_id: stream_id.to_string(),
            status,
            snapshot,
            timestamp: Utc::now(),
        }
    }
}

/// Fans snapshot updates out to any number of listeners.
#[derive(Clone)]
pub struct SnapshotBroadcaster {
    sender: Arc<broadcast::Sender<SnapshotUpdate>>,
}

impl SnapshotBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an update to all subscribers.
    pub fn send(&self, update: SnapshotUpdate) {
        // No active receivers is fine
        let _ = self.sender.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotUpdate> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SnapshotBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
