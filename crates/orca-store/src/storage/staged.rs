use std::collections::BTreeMap;

/// Committed entries plus a write set that has not been applied yet
#[derive(Debug, Clone, Default)]
pub(crate) struct StagedMap {
    pub(crate) committed: BTreeMap<Vec<u8>, Vec<u8>>,
    pending: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl StagedMap {
    pub(crate) fn with_committed(committed: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        StagedMap {
            committed,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.pending
            .get(key)
            .or_else(|| self.committed.get(key))
            .cloned()
    }

    pub(crate) fn stage(&mut self, key: &[u8], value: &[u8]) {
        self.pending.insert(key.to_vec(), value.to_vec());
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Compute the committed map that would result from applying the write set
    pub(crate) fn preview(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        let mut next = self.committed.clone();
        next.extend(
            self.pending
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        next
    }

    pub(crate) fn install(&mut self, committed: BTreeMap<Vec<u8>, Vec<u8>>) {
        self.committed = committed;
        self.pending.clear();
    }

    pub(crate) fn rollback(&mut self) {
        self.pending.clear();
    }
}
