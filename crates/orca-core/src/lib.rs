//! Orca Core - Identifiers, plugin data types, cryptography, and serialization
//!
//! This crate provides the foundational types shared by every component of
//! the oracle reporting protocol.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{
    expand_seed, hash_blake3, keyed_hash, sign, verify, DigestBuilder, Hash, KeyPair, PublicKey,
    SecretKey, Sig,
};
pub use error::CoreError;
pub use types::*;
