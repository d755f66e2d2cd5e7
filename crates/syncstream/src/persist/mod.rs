//! Durable snapshot storage for reload continuity.
//!
//! Storage is consumed through the small [`KeyValueStore`] trait so the
//! registry does not care whether records land in memory, in SQLite or in
//! some host-provided store.

pub mod bridge;
pub mod memory;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::PersistenceConfig;
use crate::db::{default_database_path, Database, DatabaseError};

pub use bridge::{PersistedRecord, PersistenceBridge};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Errors from persisting or loading records.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Failed to encode progress record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Progress store error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Progress store lock poisoned")]
    LockPoisoned,

    #[error("No home directory to place the progress database in")]
    NoDataDir,
}

/// Synchronous string key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistError>;
    fn remove(&self, key: &str) -> Result<(), PersistError>;
}

/// Opens the SQLite-backed bridge described by `config`.
///
/// Without an explicit `database_path` the database lives under the home
/// directory.
pub fn open_bridge(config: &PersistenceConfig) -> Result<PersistenceBridge, PersistError> {
    let path = match &config.database_path {
        Some(path) => PathBuf::from(path),
        None => default_database_path().ok_or(PersistError::NoDataDir)?,
    };
    let store = SqliteStore::new(Database::open(&path)?);
    Ok(PersistenceBridge::with_prefix(
        Arc::new(store),
        &config.key_prefix,
    ))
}
