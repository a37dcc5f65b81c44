use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Leadership era counter. Non-decreasing on every oracle.
pub type Epoch = u64;

/// Sequence number of an agreed round. Committed history has no gaps.
pub type SeqNr = u64;

/// Identifier of one immutable protocol configuration.
///
/// Every signed payload is domain-separated by the digest, so signatures
/// never transfer between configurations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ConfigDigest(pub [u8; 32]);

impl ConfigDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes: [u8; 32] = hex::decode(s)?
            .try_into()
            .map_err(|_| CoreError::InvalidHashLength)?;
        Ok(ConfigDigest(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigDigest({})", self.to_hex())
    }
}

impl fmt::Display for ConfigDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Index of an oracle within a configuration, in `[0, n)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct OracleId(pub u8);

impl OracleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Every oracle id of an `n`-oracle configuration, in ascending order
    pub fn all(n: usize) -> impl Iterator<Item = OracleId> {
        (0..n).map(|i| OracleId(i as u8))
    }
}

impl From<u8> for OracleId {
    fn from(value: u8) -> Self {
        OracleId(value)
    }
}

impl fmt::Debug for OracleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oracle#{}", self.0)
    }
}

impl fmt::Display for OracleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_digest_hex_roundtrip() {
        let digest = ConfigDigest([7u8; 32]);
        assert_eq!(ConfigDigest::from_hex(&digest.to_hex()).unwrap(), digest);
        assert!(ConfigDigest::from_hex("abcd").is_err());
    }

    #[test]
    fn test_oracle_ids_enumerate_in_order() {
        let ids: Vec<_> = OracleId::all(4).collect();
        assert_eq!(ids, vec![OracleId(0), OracleId(1), OracleId(2), OracleId(3)]);
    }
}
