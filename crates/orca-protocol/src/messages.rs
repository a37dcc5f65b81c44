//! Wire messages between oracles.
//!
//! Messages are grouped by the component that consumes them so the
//! dispatcher can route without inspecting payloads.

use orca_core::serialize::{from_bytes_bounded, to_bytes};
use orca_core::{CoreError, Epoch, Query, SeqNr};
use serde::{Deserialize, Serialize};

use crate::config::SharedConfig;
use crate::error::MessageError;
use crate::qc::{CertifiedCommit, CertifiedPrepareOrCommit, EpochStartProof};
use crate::signed_data::{
    AttributedSignedObservation, CommitSignature, PrepareSignature, SignedHighestCertifiedTimestamp,
    SignedObservation,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Pacemaker(PacemakerMessage),
    OutcomeGeneration(OutcomeGenerationMessage),
    ReportAttestation(ReportAttestationMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacemakerMessage {
    NewEpochWish { epoch: Epoch },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeGenerationMessage {
    /// Follower to leader: the follower's highest certified state
    EpochStartRequest {
        epoch: Epoch,
        highest_certified: CertifiedPrepareOrCommit,
        signed_highest_certified_timestamp: SignedHighestCertifiedTimestamp,
    },
    EpochStart {
        epoch: Epoch,
        epoch_start_proof: EpochStartProof,
    },
    RoundStart {
        epoch: Epoch,
        seq_nr: SeqNr,
        query: Query,
    },
    /// Follower to leader only
    Observation {
        epoch: Epoch,
        seq_nr: SeqNr,
        signed_observation: SignedObservation,
    },
    Proposal {
        epoch: Epoch,
        seq_nr: SeqNr,
        attributed_signed_observations: Vec<AttributedSignedObservation>,
    },
    Prepare {
        epoch: Epoch,
        seq_nr: SeqNr,
        signature: PrepareSignature,
    },
    Commit {
        epoch: Epoch,
        seq_nr: SeqNr,
        signature: CommitSignature,
    },
}

impl OutcomeGenerationMessage {
    pub fn epoch(&self) -> Epoch {
        match self {
            OutcomeGenerationMessage::EpochStartRequest { epoch, .. }
            | OutcomeGenerationMessage::EpochStart { epoch, .. }
            | OutcomeGenerationMessage::RoundStart { epoch, .. }
            | OutcomeGenerationMessage::Observation { epoch, .. }
            | OutcomeGenerationMessage::Proposal { epoch, .. }
            | OutcomeGenerationMessage::Prepare { epoch, .. }
            | OutcomeGenerationMessage::Commit { epoch, .. } => *epoch,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutcomeGenerationMessage::EpochStartRequest { .. } => "epoch_start_request",
            OutcomeGenerationMessage::EpochStart { .. } => "epoch_start",
            OutcomeGenerationMessage::RoundStart { .. } => "round_start",
            OutcomeGenerationMessage::Observation { .. } => "observation",
            OutcomeGenerationMessage::Proposal { .. } => "proposal",
            OutcomeGenerationMessage::Prepare { .. } => "prepare",
            OutcomeGenerationMessage::Commit { .. } => "commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportAttestationMessage {
    /// One onchain signature per report, in report order
    ReportSignatures {
        seq_nr: SeqNr,
        report_signatures: Vec<Vec<u8>>,
    },
    CertifiedCommitRequest {
        seq_nr: SeqNr,
    },
    CertifiedCommit {
        certified_commit: CertifiedCommit,
    },
}

impl From<PacemakerMessage> for Message {
    fn from(message: PacemakerMessage) -> Self {
        Message::Pacemaker(message)
    }
}

impl From<OutcomeGenerationMessage> for Message {
    fn from(message: OutcomeGenerationMessage) -> Self {
        Message::OutcomeGeneration(message)
    }
}

impl From<ReportAttestationMessage> for Message {
    fn from(message: ReportAttestationMessage) -> Self {
        Message::ReportAttestation(message)
    }
}

fn check_len(field: &'static str, len: usize, limit: usize) -> Result<(), MessageError> {
    if len > limit {
        return Err(MessageError::TooLong { field, len, limit });
    }
    Ok(())
}

fn check_certified(
    certified: &CertifiedPrepareOrCommit,
    config: &SharedConfig,
) -> Result<(), MessageError> {
    check_len("outcome", certified.outcome().len(), config.max_outcome_length)?;
    let signatures = match certified {
        CertifiedPrepareOrCommit::Prepare(cp) => cp.prepare_quorum_certificate.len(),
        CertifiedPrepareOrCommit::Commit(cc) => cc.commit_quorum_certificate.len(),
    };
    check_len("quorum certificate", signatures, config.n())
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        to_bytes(self)
    }

    /// Decode an untrusted frame of at most `max_size` bytes
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<Self, MessageError> {
        Ok(from_bytes_bounded(bytes, max_size)?)
    }

    /// Reject payloads exceeding the configured bounds.
    ///
    /// Cryptographic validity is checked later by the receiving component.
    pub fn check_limits(
        &self,
        config: &SharedConfig,
        max_signature_length: usize,
    ) -> Result<(), MessageError> {
        match self {
            Message::Pacemaker(PacemakerMessage::NewEpochWish { .. }) => Ok(()),
            Message::OutcomeGeneration(message) => match message {
                OutcomeGenerationMessage::EpochStartRequest {
                    highest_certified, ..
                } => check_certified(highest_certified, config),
                OutcomeGenerationMessage::EpochStart {
                    epoch_start_proof, ..
                } => {
                    check_len(
                        "epoch start proof",
                        epoch_start_proof.highest_certified_proof.len(),
                        config.n(),
                    )?;
                    check_certified(&epoch_start_proof.highest_certified, config)
                }
                OutcomeGenerationMessage::RoundStart { query, .. } => {
                    check_len("query", query.len(), config.max_query_length)
                }
                OutcomeGenerationMessage::Observation {
                    signed_observation, ..
                } => check_len(
                    "observation",
                    signed_observation.observation.len(),
                    config.max_observation_length,
                ),
                OutcomeGenerationMessage::Proposal {
                    attributed_signed_observations,
                    ..
                } => {
                    check_len(
                        "proposal",
                        attributed_signed_observations.len(),
                        config.n(),
                    )?;
                    for aso in attributed_signed_observations {
                        check_len(
                            "observation",
                            aso.signed_observation.observation.len(),
                            config.max_observation_length,
                        )?;
                    }
                    Ok(())
                }
                OutcomeGenerationMessage::Prepare { .. }
                | OutcomeGenerationMessage::Commit { .. } => Ok(()),
            },
            Message::ReportAttestation(message) => match message {
                ReportAttestationMessage::ReportSignatures {
                    report_signatures, ..
                } => {
                    check_len(
                        "report signatures",
                        report_signatures.len(),
                        config.max_report_count,
                    )?;
                    for signature in report_signatures {
                        check_len("report signature", signature.len(), max_signature_length)?;
                    }
                    Ok(())
                }
                ReportAttestationMessage::CertifiedCommitRequest { .. } => Ok(()),
                ReportAttestationMessage::CertifiedCommit { certified_commit } => {
                    check_len(
                        "outcome",
                        certified_commit.outcome.len(),
                        config.max_outcome_length,
                    )?;
                    check_len(
                        "quorum certificate",
                        certified_commit.commit_quorum_certificate.len(),
                        config.n(),
                    )
                }
            },
        }
    }
}
