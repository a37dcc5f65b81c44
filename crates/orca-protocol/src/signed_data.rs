//! Signed payloads exchanged during outcome generation.
//!
//! Every signature covers a domain-separated digest that binds the config
//! digest and the epoch the payload was produced in, so nothing signed in one
//! epoch or configuration verifies in another.

use orca_core::{
    verify, AttributedObservation, ConfigDigest, CoreError, DigestBuilder, Epoch, Hash,
    Observation, OracleId, PublicKey, SeqNr, Sig,
};
use serde::{Deserialize, Serialize};

use crate::keyring::OffchainKeyring;

/// Identifies one epoch of one protocol instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeGenerationId {
    pub config_digest: ConfigDigest,
    pub epoch: Epoch,
}

impl OutcomeGenerationId {
    pub fn new(config_digest: ConfigDigest, epoch: Epoch) -> Self {
        OutcomeGenerationId {
            config_digest,
            epoch,
        }
    }

    fn digest(&self, domain: &[u8]) -> DigestBuilder {
        DigestBuilder::new(domain)
            .bytes(self.config_digest.as_bytes())
            .u64(self.epoch)
    }
}

pub fn outcome_digest(outcome: &[u8]) -> Hash {
    DigestBuilder::new(b"orca/outcome").bytes(outcome).finish()
}

pub fn query_digest(query: &[u8]) -> Hash {
    DigestBuilder::new(b"orca/query").bytes(query).finish()
}

/// Digest of everything the outcome of a round is computed from.
///
/// Observations must already be ordered by observer.
pub fn outcome_inputs_digest(
    ogid: OutcomeGenerationId,
    seq_nr: SeqNr,
    query: &[u8],
    observations: &[AttributedObservation],
) -> Hash {
    let mut builder = ogid
        .digest(b"orca/outcome-inputs")
        .u64(seq_nr)
        .bytes(query)
        .u64(observations.len() as u64);
    for ao in observations {
        builder = builder.u64(ao.observer.0 as u64).bytes(&ao.observation);
    }
    builder.finish()
}

/// An observation signed by its observer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedObservation {
    pub observation: Observation,
    pub signature: Sig,
}

impl SignedObservation {
    fn message(ogid: OutcomeGenerationId, seq_nr: SeqNr, query: &[u8], observation: &[u8]) -> Hash {
        ogid.digest(b"orca/observation")
            .u64(seq_nr)
            .hash(&query_digest(query))
            .bytes(observation)
            .finish()
    }

    pub fn sign(
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        query: &[u8],
        observation: Observation,
        keyring: &dyn OffchainKeyring,
    ) -> Self {
        let message = Self::message(ogid, seq_nr, query, &observation);
        SignedObservation {
            signature: keyring.sign(message.as_bytes()),
            observation,
        }
    }

    pub fn verify(
        &self,
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        query: &[u8],
        public_key: &PublicKey,
    ) -> Result<(), CoreError> {
        let message = Self::message(ogid, seq_nr, query, &self.observation);
        verify(public_key, message.as_bytes(), &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedSignedObservation {
    pub signed_observation: SignedObservation,
    pub observer: OracleId,
}

impl AttributedSignedObservation {
    pub fn attributed_observation(&self) -> AttributedObservation {
        AttributedObservation {
            observation: self.signed_observation.observation.clone(),
            observer: self.observer,
        }
    }
}

/// Signature endorsing an outcome computed from specific inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareSignature(pub Sig);

impl PrepareSignature {
    fn message(
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        inputs_digest: &Hash,
        outcome_digest: &Hash,
    ) -> Hash {
        ogid.digest(b"orca/prepare")
            .u64(seq_nr)
            .hash(inputs_digest)
            .hash(outcome_digest)
            .finish()
    }

    pub fn sign(
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        inputs_digest: &Hash,
        outcome_digest: &Hash,
        keyring: &dyn OffchainKeyring,
    ) -> Self {
        let message = Self::message(ogid, seq_nr, inputs_digest, outcome_digest);
        PrepareSignature(keyring.sign(message.as_bytes()))
    }

    pub fn verify(
        &self,
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        inputs_digest: &Hash,
        outcome_digest: &Hash,
        public_key: &PublicKey,
    ) -> Result<(), CoreError> {
        let message = Self::message(ogid, seq_nr, inputs_digest, outcome_digest);
        verify(public_key, message.as_bytes(), &self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedPrepareSignature {
    pub signature: PrepareSignature,
    pub signer: OracleId,
}

/// Signature endorsing the commitment of an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSignature(pub Sig);

impl CommitSignature {
    fn message(ogid: OutcomeGenerationId, seq_nr: SeqNr, outcome_digest: &Hash) -> Hash {
        ogid.digest(b"orca/commit")
            .u64(seq_nr)
            .hash(outcome_digest)
            .finish()
    }

    pub fn sign(
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        outcome_digest: &Hash,
        keyring: &dyn OffchainKeyring,
    ) -> Self {
        CommitSignature(keyring.sign(Self::message(ogid, seq_nr, outcome_digest).as_bytes()))
    }

    pub fn verify(
        &self,
        ogid: OutcomeGenerationId,
        seq_nr: SeqNr,
        outcome_digest: &Hash,
        public_key: &PublicKey,
    ) -> Result<(), CoreError> {
        let message = Self::message(ogid, seq_nr, outcome_digest);
        verify(public_key, message.as_bytes(), &self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedCommitSignature {
    pub signature: CommitSignature,
    pub signer: OracleId,
}

/// Position of a certified value in the committed history.
///
/// Ordered by sequence number first; at equal sequence numbers a commit
/// outranks a prepare, and between two of the same kind the one certified in
/// the later epoch wins. A prepare from a later epoch supersedes any earlier
/// prepare at that sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct HighestCertifiedTimestamp {
    pub seq_nr: SeqNr,
    pub committed_else_prepared: bool,
    /// Epoch the certificate was formed in
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHighestCertifiedTimestamp {
    pub timestamp: HighestCertifiedTimestamp,
    pub signature: Sig,
}

impl SignedHighestCertifiedTimestamp {
    fn message(ogid: OutcomeGenerationId, timestamp: HighestCertifiedTimestamp) -> Hash {
        ogid.digest(b"orca/highest-certified-timestamp")
            .u64(timestamp.seq_nr)
            .bool(timestamp.committed_else_prepared)
            .u64(timestamp.epoch)
            .finish()
    }

    pub fn sign(
        ogid: OutcomeGenerationId,
        timestamp: HighestCertifiedTimestamp,
        keyring: &dyn OffchainKeyring,
    ) -> Self {
        SignedHighestCertifiedTimestamp {
            timestamp,
            signature: keyring.sign(Self::message(ogid, timestamp).as_bytes()),
        }
    }

    pub fn verify(
        &self,
        ogid: OutcomeGenerationId,
        public_key: &PublicKey,
    ) -> Result<(), CoreError> {
        let message = Self::message(ogid, self.timestamp);
        verify(public_key, message.as_bytes(), &self.signature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedSignedHighestCertifiedTimestamp {
    pub signed_timestamp: SignedHighestCertifiedTimestamp,
    pub signer: OracleId,
}
