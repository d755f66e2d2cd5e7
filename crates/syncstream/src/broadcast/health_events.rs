//! Health event broadcaster for stale subscription alerts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Advisory signal raised by the health monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthEvent {
    /// No event arrived for longer than the staleness threshold.
    #[serde(rename_all = "camelCase")]
    Stale {
        key: String,
        stream_id: String,
        last_event_at: DateTime<Utc>,
        idle_secs: i64,
    },
    /// A previously stale subscription received an event again.
    #[serde(rename_all = "camelCase")]
    Recovered { key: String, stream_id: String },
}

impl HealthEvent {
    pub fn key(&self) -> &str {
        match self {
            HealthEvent::Stale { key, .. } | HealthEvent::Recovered { key, .. } => key,
        }
    }
}

/// Fans health events out to remediation listeners.
#[derive(Clone)]
pub struct HealthBroadcaster {
    sender: Arc<broadcast::Sender<HealthEvent>>,
}

impl HealthBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: HealthEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.sender.subscribe()
    }
}

impl Default for HealthBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
