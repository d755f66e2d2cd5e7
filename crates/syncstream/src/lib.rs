//! Streaming subscription and progress-aggregation engine.
//!
//! Opens long-lived server-pushed event streams, folds their frames into
//! snapshots, keeps at most one live stream per key and persists progress
//! so it survives a restart.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod persist;
pub mod progress;
pub mod query;
pub mod registry;
pub mod stream;
pub mod telemetry;

pub use api::{ApiError, JobLauncher, SyncApiClient};
pub use broadcast::{HealthEvent, SnapshotUpdate};
pub use config::{load_config, load_config_from_str, StreamConfig};
pub use error::{ConfigError, Result, SyncStreamError};
pub use persist::{KeyValueStore, MemoryStore, PersistenceBridge, SqliteStore};
pub use progress::{AnswerSnapshot, AnswerStatus, SyncSnapshot};
pub use query::{QueryRequest, QueryStreamer};
pub use registry::{Subscription, SubscriptionRegistry, SubscriptionStatus};
pub use stream::{CredentialProvider, Credentials, HttpTransport, StaticCredentials, StreamTransport};
pub use telemetry::init_tracing;
