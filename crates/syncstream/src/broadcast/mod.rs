//! Broadcasting modules for real-time snapshot streaming.
//!
//! Each broadcaster wraps a `tokio::sync::broadcast` channel; sending never
//! fails when nobody listens.

pub mod answer_updates;
pub mod health_events;
pub mod snapshot_updates;

pub use answer_updates::AnswerBroadcaster;
pub use health_events::{HealthBroadcaster, HealthEvent};
pub use snapshot_updates::{SnapshotBroadcaster, SnapshotUpdate};
