//! Aggregation of partial stream events into consistent snapshots.
//!
//! Sync progress and query answers fold differently on purpose: progress
//! counters are absolute values replaced on every event, answer text is an
//! incremental delta appended on every event.

pub mod answer;
pub mod snapshot;

pub use answer::{AnswerSnapshot, AnswerStatus};
pub use snapshot::{SyncCounters, SyncSnapshot, DEFAULT_FAILURE_MESSAGE};
