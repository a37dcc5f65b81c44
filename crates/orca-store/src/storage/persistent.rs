use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use orca_core::serialize;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::staged::StagedMap;
use super::Storage;
use crate::error::StoreError;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// File-backed storage using a single snapshot file.
///
/// `commit` writes the full snapshot to a temporary file, syncs it, and
/// renames it over the previous snapshot, so a crash leaves either the old
/// or the new contents on disk.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    map: StagedMap,
}

impl FileStorage {
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, StoreError> {
        let path = path.into();
        let committed = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                let snapshot: Snapshot = serialize::from_bytes(&bytes)
                    .map_err(|e| StoreError::Corrupt(e.to_string()))?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::UnsupportedVersion(snapshot.version));
                }
                snapshot.entries
            }
        } else {
            BTreeMap::new()
        };

        debug!("Opened {:?} with {} keys", path, committed.len());

        Ok(FileStorage {
            path,
            map: StagedMap::with_committed(committed),
        })
    }

    fn write_snapshot(&self, entries: BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        };
        let bytes = serialize::to_bytes(&snapshot)?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.map.stage(key, value);
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.map.has_pending() {
            return Ok(());
        }
        let next = self.map.preview();
        // Staged writes survive a failed flush so the caller can retry.
        self.write_snapshot(next.clone())?;
        self.map.install(next);
        Ok(())
    }

    fn rollback(&mut self) {
        self.map.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "orca-store-{}-{}",
            name,
            rand::random::<u64>()
        ));
        dir.join("db.bin")
    }

    #[test]
    fn test_commit_survives_reopen() {
        let path = temp_path("reopen");
        {
            let mut storage = FileStorage::open(&path).unwrap();
            storage.put(b"pacemaker", b"state");
            storage.commit().unwrap();
        }
        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.get(b"pacemaker"), Some(b"state".to_vec()));
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_uncommitted_writes_are_not_persisted() {
        let path = temp_path("uncommitted");
        {
            let mut storage = FileStorage::open(&path).unwrap();
            storage.put(b"a", b"1");
            storage.commit().unwrap();
            storage.put(b"b", b"2");
        }
        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(storage.get(b"b"), None);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_corrupt_snapshot_is_rejected() {
        let path = temp_path("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"\x01").unwrap();
        assert!(FileStorage::open(&path).is_err());
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
