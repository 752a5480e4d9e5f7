//! In-memory record store for testing.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{RecordStore, StoreResult};

/// An in-memory record store. Clones share the same records.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Reports whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data.lock().get(id).cloned())
    }

    fn put(&self, id: &str, record: &[u8]) -> StoreResult<()> {
        self.data.lock().insert(id.to_string(), record.to_vec());
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        self.data.lock().remove(id);
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .data
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
