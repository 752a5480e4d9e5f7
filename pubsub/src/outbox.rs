//! Durable at-least-once outbox for published messages.
//!
//! Every saved message is written to a [`RecordStore`] (one record per
//! message id) and mirrored in an in-memory index. Records move from
//! *saved* to *acknowledged* exactly once and are removed by
//! [`Outbox::clean_acknowledged`] after a retention cutoff.
//!
//! The index is filled from the backend on first access. Concurrent first
//! callers wait for that single load instead of loading twice.
//!
//! Writes for one message id are serialized: the acknowledged check, the
//! backend write and the index update happen under the id's write lock, so
//! an acknowledged record never reverts to pending.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{RecordStore, StoreError};
use crate::types::QoS;

/// A message kept in the outbox until the broker confirmed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMessage {
    pub message_id: String,
    pub topic: String,
    #[serde(with = "payload_base64")]
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub created_at: DateTime<Utc>,
    pub is_acknowledged: bool,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

impl PersistedMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Persistence(StoreError::Serialization(e.to_string())))
    }

    fn decode(data: &[u8]) -> std::result::Result<Self, StoreError> {
        serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

const WRITE_LOCKS: usize = 16;

/// Durable outbox keyed by message id.
pub struct Outbox {
    backend: Arc<dyn RecordStore>,
    index: RwLock<HashMap<String, PersistedMessage>>,
    loaded: OnceCell<()>,
    /// Striped by message id; held across check, backend write and index update.
    write_locks: Vec<Mutex<()>>,
}

impl Outbox {
    /// Create an outbox over `backend`. Nothing is read until first use.
    pub fn new(backend: Arc<dyn RecordStore>) -> Self {
        Self {
            backend,
            index: RwLock::new(HashMap::new()),
            loaded: OnceCell::new(),
            write_locks: (0..WRITE_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock_id(&self, message_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        message_id.hash(&mut hasher);
        let slot = (hasher.finish() % self.write_locks.len() as u64) as usize;
        self.write_locks[slot].lock()
    }

    fn ensure_loaded(&self) -> Result<()> {
        self.loaded.get_or_try_init(|| {
            let records = self.backend.list()?;
            let mut index = self.index.write();
            for (id, data) in records {
                match PersistedMessage::decode(&data) {
                    Ok(record) => {
                        index.insert(record.message_id.clone(), record);
                    }
                    Err(e) => warn!(message_id = %id, error = %e, "outbox: skipping unreadable record"),
                }
            }
            debug!(count = index.len(), "outbox: loaded records");
            Ok::<(), Error>(())
        })?;
        Ok(())
    }

    /// Save a message in the *saved* state, replacing an unacknowledged
    /// record with the same id.
    ///
    /// The record is durable when this returns `Ok`.
    pub fn save_message(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        message_id: &str,
    ) -> Result<()> {
        self.ensure_loaded()?;
        let _guard = self.lock_id(message_id);

        if let Some(existing) = self.index.read().get(message_id) {
            if existing.is_acknowledged {
                return Err(Error::AlreadyAcknowledged(message_id.to_string()));
            }
        }

        let record = PersistedMessage {
            message_id: message_id.to_string(),
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            created_at: Utc::now(),
            is_acknowledged: false,
            acknowledged_at: None,
        };
        self.backend.put(message_id, &record.encode()?)?;
        self.index.write().insert(message_id.to_string(), record);
        debug!(message_id, topic, "outbox: saved");
        Ok(())
    }

    /// Mark a message acknowledged.
    ///
    /// Returns `Ok(false)` for an unknown id. Acknowledging twice keeps the
    /// first acknowledgement time.
    pub fn mark_acknowledged(&self, message_id: &str) -> Result<bool> {
        self.ensure_loaded()?;
        let _guard = self.lock_id(message_id);

        let Some(mut record) = self.index.read().get(message_id).cloned() else {
            debug!(message_id, "outbox: acknowledge for unknown message");
            return Ok(false);
        };
        if record.is_acknowledged {
            return Ok(true);
        }

        record.is_acknowledged = true;
        record.acknowledged_at = Some(Utc::now());
        self.backend.put(message_id, &record.encode()?)?;
        self.index.write().insert(message_id.to_string(), record);
        Ok(true)
    }

    /// Get a record by id.
    pub fn get(&self, message_id: &str) -> Result<Option<PersistedMessage>> {
        self.ensure_loaded()?;
        Ok(self.index.read().get(message_id).cloned())
    }

    /// Every unacknowledged record, oldest first.
    pub fn pending_messages(&self) -> Result<Vec<PersistedMessage>> {
        self.ensure_loaded()?;
        let mut pending: Vec<PersistedMessage> = self
            .index
            .read()
            .values()
            .filter(|r| !r.is_acknowledged)
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(pending)
    }

    /// Number of records currently held, acknowledged or not.
    pub fn len(&self) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.index.read().len())
    }

    /// Reports whether the outbox holds no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every acknowledged record acknowledged before `older_than`.
    ///
    /// A record whose backend deletion fails is logged and kept for the next
    /// call; the remaining candidates are still processed. Returns the number
    /// of records removed.
    pub fn clean_acknowledged(&self, older_than: DateTime<Utc>) -> Result<usize> {
        self.ensure_loaded()?;

        let candidates: Vec<String> = self
            .index
            .read()
            .values()
            .filter(|r| r.is_acknowledged && r.acknowledged_at.is_some_and(|at| at < older_than))
            .map(|r| r.message_id.clone())
            .collect();

        let mut removed = 0;
        for id in candidates {
            let _guard = self.lock_id(&id);
            if let Err(e) = self.backend.remove(&id) {
                warn!(message_id = %id, error = %e, "outbox: failed to remove acknowledged record");
                continue;
            }
            self.index.write().remove(&id);
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, "outbox: cleaned acknowledged records");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("loaded", &self.loaded.get().is_some())
            .finish()
    }
}
