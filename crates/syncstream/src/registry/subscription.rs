//! A single tracked stream and its lifecycle state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::progress::SyncSnapshot;
use crate::stream::CancelHandle;

/// Lifecycle status of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Completed,
    Failed,
    Removed,
}

impl SubscriptionStatus {
    /// Status implied by a snapshot's terminal flags.
    pub fn of(snapshot: &SyncSnapshot) -> Self {
        if snapshot.is_failed {
            SubscriptionStatus::Failed
        } else if snapshot.is_complete {
            SubscriptionStatus::Completed
        } else {
            SubscriptionStatus::Active
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::Completed => write!(f, "completed"),
            SubscriptionStatus::Failed => write!(f, "failed"),
            SubscriptionStatus::Removed => write!(f, "removed"),
        }
    }
}

/// Registry entry for one key.
///
/// Entries are immutable values; every change produces a new entry that
/// replaces the old one in a fresh map. Clones share the cancel handle and
/// the teardown latch.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub(crate) key: String,
    pub(crate) stream_id: String,
    /// Distinguishes this subscription from earlier ones for the same key.
    pub(crate) generation: u64,
    pub(crate) cancel: CancelHandle,
    torn_down: Arc<AtomicBool>,
    pub(crate) snapshot: SyncSnapshot,
    pub(crate) status: SubscriptionStatus,
    pub(crate) stale: bool,
    pub(crate) restored: bool,
}

impl Subscription {
    pub(crate) fn new(
        key: &str,
        stream_id: &str,
        generation: u64,
        snapshot: SyncSnapshot,
        restored: bool,
    ) -> Self {
        let status = SubscriptionStatus::of(&snapshot);
        Self {
            key: key.to_string(),
            stream_id: stream_id.to_string(),
            generation,
            cancel: CancelHandle::new(),
            torn_down: Arc::new(AtomicBool::new(false)),
            snapshot,
            status,
            stale: false,
            restored,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn snapshot(&self) -> &SyncSnapshot {
        &self.snapshot
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// True while the health monitor considers this subscription silent.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// True when the snapshot was seeded from a persisted record.
    pub fn was_restored(&self) -> bool {
        self.restored
    }

    /// Copy carrying a new snapshot. Any event clears the stale flag.
    pub(crate) fn with_snapshot(&self, snapshot: SyncSnapshot) -> Self {
        let mut next = self.clone();
        next.status = SubscriptionStatus::of(&snapshot);
        next.snapshot = snapshot;
        next.stale = false;
        next
    }

    pub(crate) fn marked_stale(&self) -> Self {
        let mut next = self.clone();
        next.stale = true;
        next
    }

    /// Claims the teardown. Only the first caller across all clones gets true.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}
