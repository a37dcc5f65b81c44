//! Events passed between the components of one oracle.

use orca_core::{Epoch, OracleId, ReportWithInfo, SeqNr};

use crate::qc::CertifiedCommit;

/// Outcome generation to pacemaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacemakerEvent {
    /// The epoch committed a round
    Progress { epoch: Epoch },
    /// The epoch cannot make further progress
    ChangeLeader { epoch: Epoch },
}

/// Pacemaker to outcome generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochStartEvent {
    pub epoch: Epoch,
    pub leader: OracleId,
}

/// Outcome generation to report attestation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOutcome {
    pub certified_commit: CertifiedCommit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedOnchainSignature {
    pub signature: Vec<u8>,
    pub signer: OracleId,
}

/// Report attestation to transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedReport<I> {
    pub seq_nr: SeqNr,
    pub index: usize,
    pub report: ReportWithInfo<I>,
    pub signatures: Vec<AttributedOnchainSignature>,
}
