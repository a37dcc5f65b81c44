use super::staged::StagedMap;
use super::Storage;
use crate::error::StoreError;

/// In-memory storage. Contents are lost when the value is dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    map: StagedMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Number of committed keys
    pub fn len(&self) -> usize {
        self.map.committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.committed.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.map.stage(key, value);
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let next = self.map.preview();
        self.map.install(next);
        Ok(())
    }

    fn rollback(&mut self) {
        self.map.rollback();
    }
}
