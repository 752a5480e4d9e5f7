//! Directory-backed record store: one file per message id.
//!
//! File names are the hex encoding of the id plus `.json`, so arbitrary ids
//! map to safe names. Every write goes to its own temporary file, is synced
//! to disk and then renamed into place.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::{RecordStore, StoreError, StoreResult};

const EXTENSION: &str = "json";

/// A persistent record store keeping one file per record.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open (creating if needed) a record directory.
    pub fn open<P: AsRef<Path>>(root: P) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.{EXTENSION}", hex::encode(id)))
    }

    fn id_for(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        String::from_utf8(hex::decode(stem).ok()?).ok()
    }
}

impl RecordStore for DirStore {
    fn get(&self, id: &str) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Storage(e.to_string())),
        }
    }

    fn put(&self, id: &str, record: &[u8]) -> StoreResult<()> {
        let storage = |e: std::io::Error| StoreError::Storage(e.to_string());

        let mut tmp = NamedTempFile::new_in(&self.root).map_err(storage)?;
        tmp.write_all(record).map_err(storage)?;
        tmp.as_file().sync_all().map_err(storage)?;
        tmp.persist(self.path_for(id)).map_err(|e| storage(e.error))?;

        // The rename itself is durable once the directory entry is synced.
        #[cfg(unix)]
        fs::File::open(&self.root)
            .and_then(|dir| dir.sync_all())
            .map_err(storage)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Storage(e.to_string())),
        }
    }

    fn list(&self) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| StoreError::Storage(e.to_string()))?.path();
            let Some(id) = Self::id_for(&path) else {
                continue;
            };
            let data = fs::read(&path).map_err(|e| StoreError::Storage(e.to_string()))?;
            results.push((id, data));
        }

        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}
