//! Redb-backed record store: one row per message id in a single table.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use super::{RecordStore, StoreError, StoreResult};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("outbox");

fn storage<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Storage(e.to_string())
}

/// A persistent record store backed by redb.
pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(storage)?;
            }
        }
        let db = Database::create(path).map_err(storage)?;

        // Create the table so that read transactions never see it missing.
        let tx = db.begin_write().map_err(storage)?;
        {
            let _ = tx.open_table(TABLE).map_err(storage)?;
        }
        tx.commit().map_err(storage)?;

        Ok(Self { db })
    }
}

impl RecordStore for RedbStore {
    fn get(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;
        Ok(table.get(id).map_err(storage)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, id: &str, record: &[u8]) -> StoreResult<()> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            table.insert(id, record).map_err(storage)?;
        }
        tx.commit().map_err(storage)
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        let tx = self.db.begin_write().map_err(storage)?;
        {
            let mut table = tx.open_table(TABLE).map_err(storage)?;
            table.remove(id).map_err(storage)?;
        }
        tx.commit().map_err(storage)
    }

    fn list(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(storage)?;
        let table = tx.open_table(TABLE).map_err(storage)?;

        let mut results = Vec::new();
        for item in table.iter().map_err(storage)? {
            let (key, value) = item.map_err(storage)?;
            results.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(results)
    }
}
