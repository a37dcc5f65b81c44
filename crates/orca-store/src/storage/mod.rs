pub mod memory;
pub mod persistent;
mod staged;

use crate::error::StoreError;

/// Key-value storage with staged writes.
///
/// Writes are buffered until `commit`, which applies all of them
/// atomically. Durable backends must not return from `commit` before the
/// data would survive a crash.
pub trait Storage: Send {
    /// Get a value by key, seeing staged writes
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Stage a key-value pair
    fn put(&mut self, key: &[u8], value: &[u8]);

    /// Apply staged writes atomically
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard staged writes
    fn rollback(&mut self);
}

pub use memory::MemoryStorage;
pub use persistent::FileStorage;
