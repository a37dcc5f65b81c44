use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte Blake3 digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Hash(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Compute Blake3 hash of data
pub fn hash_blake3(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// Compute a keyed Blake3 hash (a PRF under `key`)
pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> Hash {
    Hash(*blake3::keyed_hash(key, data).as_bytes())
}

/// Expand a 32-byte seed into an endless stream of pseudorandom u64 values.
///
/// Uses the Blake3 extendable output function, so the stream is identical on
/// every platform for the same seed.
pub fn expand_seed(seed: &Hash) -> impl Iterator<Item = u64> {
    let mut reader = blake3::Hasher::new_keyed(&seed.0).finalize_xof();
    std::iter::repeat_with(move || {
        let mut word = [0u8; 8];
        reader.fill(&mut word);
        u64::from_be_bytes(word)
    })
}

/// Incremental builder for domain-separated digests.
///
/// Every field is length-prefixed so that distinct field sequences can never
/// produce the same preimage.
pub struct DigestBuilder(blake3::Hasher);

impl DigestBuilder {
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(domain.len() as u64).to_be_bytes());
        hasher.update(domain);
        DigestBuilder(hasher)
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.0.update(&(data.len() as u64).to_be_bytes());
        self.0.update(data);
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        self.0.update(&value.to_be_bytes());
        self
    }

    pub fn bool(mut self, value: bool) -> Self {
        self.0.update(&[value as u8]);
        self
    }

    pub fn hash(mut self, hash: &Hash) -> Self {
        self.0.update(&hash.0);
        self
    }

    pub fn finish(self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}
