//! Serializes subscription snapshots into the key-value store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::progress::SyncSnapshot;

use super::{KeyValueStore, PersistError};

/// Default prefix for record keys.
pub const DEFAULT_KEY_PREFIX: &str = "syncstream:progress:";

/// A snapshot saved for reload continuity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub key: String,
    pub stream_id: String,
    pub snapshot: SyncSnapshot,
    pub saved_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// True when this record may seed a subscription for `stream_id`.
    pub fn can_restore(&self, stream_id: &str) -> bool {
        self.stream_id == stream_id && !self.snapshot.is_terminal()
    }
}

/// Reads and writes [`PersistedRecord`]s, one entry per subscription key.
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn KeyValueStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }

    pub fn save(
        &self,
        key: &str,
        stream_id: &str,
        snapshot: &SyncSnapshot,
    ) -> Result<(), PersistError> {
        let record = PersistedRecord {
            key: key.to_string(),
            stream_id: stream_id.to_string(),
            snapshot: snapshot.clone(),
            saved_at: Utc::now(),
        };
        let encoded = serde_json::to_string(&record)?;
        self.store.set(&self.storage_key(key), &encoded)
    }

    /// Loads the record for `key`.
    ///
    /// A record that no longer decodes is dropped from the store and
    /// reported as absent.
    pub fn load(&self, key: &str) -> Result<Option<PersistedRecord>, PersistError> {
        let storage_key = self.storage_key(key);
        let Some(raw) = self.store.get(&storage_key)? else {
            return Ok(None);
        };

        match serde_json::from_str::<PersistedRecord>(&raw) {
            Ok(record) if record.key == key => Ok(Some(record)),
            Ok(record) => {
                log::warn!(
                    "Progress record under '{}' belongs to key '{}', ignoring",
                    storage_key,
                    record.key
                );
                Ok(None)
            }
            Err(e) => {
                log::warn!(
                    "Discarding unreadable progress record '{}': {}",
                    storage_key,
                    e
                );
                self.store.remove(&storage_key)?;
                Ok(None)
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<(), PersistError> {
        self.store.remove(&self.storage_key(key))
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}
