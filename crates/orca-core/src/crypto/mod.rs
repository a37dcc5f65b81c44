pub mod hash;
pub mod keys;
pub mod signature;

pub use hash::{expand_seed, hash_blake3, keyed_hash, DigestBuilder, Hash};
pub use keys::{KeyPair, PublicKey, SecretKey};
pub use signature::{sign, verify, Sig, SIGNATURE_LENGTH};
