//! Record storage backends for the outbox.
//!
//! A [`RecordStore`] holds one opaque record per message id. Three
//! implementations are provided: [`MemoryStore`] for tests, [`RedbStore`]
//! for a single-file database and [`DirStore`] for one file per record.

mod dir;
mod memory;
mod redb;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::dir::DirStore;
pub use self::memory::MemoryStore;
pub use self::redb::RedbStore;

/// Errors that can occur in record store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store: storage error: {0}")]
    Storage(String),

    #[error("store: serialization error: {0}")]
    Serialization(String),
}

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage keyed by message id.
pub trait RecordStore: Send + Sync {
    /// Get a record by id.
    fn get(&self, id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Create or replace a record.
    fn put(&self, id: &str, record: &[u8]) -> StoreResult<()>;

    /// Delete a record. Deleting a missing record is not an error.
    fn remove(&self, id: &str) -> StoreResult<()>;

    /// List every record, sorted by id.
    fn list(&self) -> StoreResult<Vec<(String, Vec<u8>)>>;
}

impl fmt::Debug for dyn RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordStore {{ ... }}")
    }
}

/// Which backend an outbox is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Redb,
    Dir,
    Memory,
}

/// Outbox storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// Database file (redb) or directory (dir). Ignored for memory.
    #[serde(default)]
    pub path: PathBuf,
}

impl StoreSettings {
    /// Open the configured backend.
    pub fn open(&self) -> StoreResult<Arc<dyn RecordStore>> {
        Ok(match self.backend {
            BackendKind::Redb => Arc::new(RedbStore::open(&self.path)?),
            BackendKind::Dir => Arc::new(DirStore::open(&self.path)?),
            BackendKind::Memory => Arc::new(MemoryStore::new()),
        })
    }
}
