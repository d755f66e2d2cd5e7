use crate::db::{kv_repo, Database};

use super::{KeyValueStore, PersistError};

/// Store backed by the embedded SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(kv_repo::get(&self.db, key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistError> {
        Ok(kv_repo::upsert(&self.db, key, value)?)
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        kv_repo::delete(&self.db, key)?;
        Ok(())
    }
}
