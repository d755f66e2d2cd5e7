//! Aggregated progress of a sync run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::event::{ProgressPayload, SyncEvent};

/// Fallback message when the server reports a failure without details.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Sync failed";

/// Entity counters reported by a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub kept: u64,
    pub skipped: u64,
}

impl SyncCounters {
    /// Sum of all counters, saturating at `u64::MAX`.
    pub fn total(&self) -> u64 {
        [self.updated, self.deleted, self.kept, self.skipped]
            .into_iter()
            .fold(self.inserted, u64::saturating_add)
    }

    /// Takes every counter present in the payload as the new absolute value.
    fn replaced_by(&self, payload: &ProgressPayload) -> Self {
        Self {
            inserted: payload.inserted.unwrap_or(self.inserted),
            updated: payload.updated.unwrap_or(self.updated),
            deleted: payload.deleted.unwrap_or(self.deleted),
            kept: payload.kept.unwrap_or(self.kept),
            skipped: payload.skipped.unwrap_or(self.skipped),
        }
    }
}

/// Point-in-time state of one sync subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    #[serde(flatten)]
    pub counters: SyncCounters,
    pub is_complete: bool,
    pub is_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

impl SyncSnapshot {
    /// Creates an empty, non-terminal snapshot.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            counters: SyncCounters::default(),
            is_complete: false,
            is_failed: false,
            error_message: None,
            started_at: now,
            last_event_at: now,
        }
    }

    /// Returns true once the run completed or failed.
    pub fn is_terminal(&self) -> bool {
        self.is_complete || self.is_failed
    }

    /// Folds one event into the snapshot.
    ///
    /// Counters are replaced, never merged. A terminal snapshot is returned
    /// unchanged, and failure wins over completion when a payload carries both.
    pub fn apply(&self, event: &SyncEvent, at: DateTime<Utc>) -> Self {
        if self.is_terminal() {
            return self.clone();
        }

        let mut next = self.clone();
        next.last_event_at = at;

        match event {
            SyncEvent::Progress(payload) => {
                next.counters = self.counters.replaced_by(payload);
                if payload.reports_failure() {
                    next.mark_failed(payload.error_message().unwrap_or(DEFAULT_FAILURE_MESSAGE));
                } else if payload.is_complete {
                    next.is_complete = true;
                }
            }
            SyncEvent::Error { message } => {
                let message = message
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or(DEFAULT_FAILURE_MESSAGE);
                next.mark_failed(message);
            }
            SyncEvent::Connected | SyncEvent::Heartbeat | SyncEvent::Unknown => {}
        }

        next
    }

    /// Returns a failed copy, used when the transport dies under a live run.
    pub fn failed(&self, message: &str, at: DateTime<Utc>) -> Self {
        if self.is_terminal() {
            return self.clone();
        }
        let mut next = self.clone();
        next.last_event_at = at;
        next.mark_failed(message);
        next
    }

    fn mark_failed(&mut self, message: &str) {
        self.is_failed = true;
        self.is_complete = false;
        self.error_message = Some(message.to_string());
    }
}
