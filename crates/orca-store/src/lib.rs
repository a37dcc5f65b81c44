//! Orca Store - Durable key-value storage backends
//!
//! This crate provides the byte-level storage abstraction the protocol's
//! durable state is written through, with in-memory and file-backed
//! implementations.

pub mod error;
pub mod storage;

pub use error::StoreError;
pub use storage::{FileStorage, MemoryStorage, Storage};
