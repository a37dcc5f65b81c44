use orca_core::{ConfigDigest, Epoch, Hash, OracleId, Outcome, PublicKey, SeqNr};
use serde::{Deserialize, Serialize};

use crate::error::CertificateError;
use crate::signed_data::{
    outcome_digest, AttributedCommitSignature, AttributedPrepareSignature,
    AttributedSignedHighestCertifiedTimestamp, HighestCertifiedTimestamp, OutcomeGenerationId,
};

/// Outcome endorsed by a Byzantine quorum in the prepare phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedPrepare {
    pub prepare_epoch: Epoch,
    pub seq_nr: SeqNr,
    pub outcome_inputs_digest: Hash,
    pub outcome: Outcome,
    pub prepare_quorum_certificate: Vec<AttributedPrepareSignature>,
}

impl CertifiedPrepare {
    pub fn verify(
        &self,
        config_digest: ConfigDigest,
        keys: &[PublicKey],
        quorum: usize,
    ) -> Result<(), CertificateError> {
        if self.seq_nr == 0 {
            return Err(CertificateError::UnexpectedGenesis);
        }
        check_signer_set(
            self.prepare_quorum_certificate.iter().map(|s| s.signer),
            keys.len(),
            quorum,
        )?;

        let ogid = OutcomeGenerationId::new(config_digest, self.prepare_epoch);
        let digest = outcome_digest(&self.outcome);
        for aps in &self.prepare_quorum_certificate {
            aps.signature
                .verify(
                    ogid,
                    self.seq_nr,
                    &self.outcome_inputs_digest,
                    &digest,
                    &keys[aps.signer.index()],
                )
                .map_err(|_| CertificateError::InvalidSignature(aps.signer))?;
        }
        Ok(())
    }
}

/// Proof that an outcome was committed at a sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertifiedCommit {
    pub commit_epoch: Epoch,
    pub seq_nr: SeqNr,
    pub outcome: Outcome,
    pub commit_quorum_certificate: Vec<AttributedCommitSignature>,
}

impl CertifiedCommit {
    /// Stand-in for "nothing committed yet"
    pub fn genesis() -> Self {
        CertifiedCommit {
            commit_epoch: 0,
            seq_nr: 0,
            outcome: Vec::new(),
            commit_quorum_certificate: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::genesis()
    }

    /// Verify a certificate for an actual round; genesis is rejected
    pub fn verify(
        &self,
        config_digest: ConfigDigest,
        keys: &[PublicKey],
        quorum: usize,
    ) -> Result<(), CertificateError> {
        if self.seq_nr == 0 {
            return Err(CertificateError::UnexpectedGenesis);
        }
        check_signer_set(
            self.commit_quorum_certificate.iter().map(|s| s.signer),
            keys.len(),
            quorum,
        )?;

        let ogid = OutcomeGenerationId::new(config_digest, self.commit_epoch);
        let digest = outcome_digest(&self.outcome);
        for acs in &self.commit_quorum_certificate {
            acs.signature
                .verify(ogid, self.seq_nr, &digest, &keys[acs.signer.index()])
                .map_err(|_| CertificateError::InvalidSignature(acs.signer))?;
        }
        Ok(())
    }
}

/// Highest certified state an oracle knows of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertifiedPrepareOrCommit {
    Prepare(CertifiedPrepare),
    Commit(CertifiedCommit),
}

impl CertifiedPrepareOrCommit {
    pub fn genesis() -> Self {
        CertifiedPrepareOrCommit::Commit(CertifiedCommit::genesis())
    }

    pub fn is_genesis(&self) -> bool {
        matches!(self, CertifiedPrepareOrCommit::Commit(cc) if cc.is_genesis())
    }

    pub fn seq_nr(&self) -> SeqNr {
        match self {
            CertifiedPrepareOrCommit::Prepare(cp) => cp.seq_nr,
            CertifiedPrepareOrCommit::Commit(cc) => cc.seq_nr,
        }
    }

    pub fn outcome(&self) -> &Outcome {
        match self {
            CertifiedPrepareOrCommit::Prepare(cp) => &cp.outcome,
            CertifiedPrepareOrCommit::Commit(cc) => &cc.outcome,
        }
    }

    pub fn timestamp(&self) -> HighestCertifiedTimestamp {
        match self {
            CertifiedPrepareOrCommit::Prepare(cp) => HighestCertifiedTimestamp {
                seq_nr: cp.seq_nr,
                committed_else_prepared: false,
                epoch: cp.prepare_epoch,
            },
            CertifiedPrepareOrCommit::Commit(cc) => HighestCertifiedTimestamp {
                seq_nr: cc.seq_nr,
                committed_else_prepared: true,
                epoch: cc.commit_epoch,
            },
        }
    }

    pub fn verify(
        &self,
        config_digest: ConfigDigest,
        keys: &[PublicKey],
        quorum: usize,
    ) -> Result<(), CertificateError> {
        match self {
            CertifiedPrepareOrCommit::Commit(cc) if cc.seq_nr == 0 => {
                if cc.is_genesis() {
                    Ok(())
                } else {
                    Err(CertificateError::MalformedGenesis)
                }
            }
            CertifiedPrepareOrCommit::Commit(cc) => cc.verify(config_digest, keys, quorum),
            CertifiedPrepareOrCommit::Prepare(cp) => cp.verify(config_digest, keys, quorum),
        }
    }
}

/// Leader's justification for the state an epoch starts from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStartProof {
    pub highest_certified: CertifiedPrepareOrCommit,
    pub highest_certified_proof: Vec<AttributedSignedHighestCertifiedTimestamp>,
}

impl EpochStartProof {
    pub fn verify(
        &self,
        ogid: OutcomeGenerationId,
        keys: &[PublicKey],
        quorum: usize,
    ) -> Result<(), CertificateError> {
        check_signer_set(
            self.highest_certified_proof.iter().map(|p| p.signer),
            keys.len(),
            quorum,
        )?;

        let mut highest = HighestCertifiedTimestamp::default();
        for proof in &self.highest_certified_proof {
            proof
                .signed_timestamp
                .verify(ogid, &keys[proof.signer.index()])
                .map_err(|_| CertificateError::InvalidSignature(proof.signer))?;
            highest = highest.max(proof.signed_timestamp.timestamp);
        }
        if highest != self.highest_certified.timestamp() {
            return Err(CertificateError::TimestampMismatch);
        }

        self.highest_certified
            .verify(ogid.config_digest, keys, quorum)
    }
}

/// Signer count within `[quorum, n]`, every signer in range and distinct
fn check_signer_set(
    signers: impl ExactSizeIterator<Item = OracleId>,
    n: usize,
    quorum: usize,
) -> Result<(), CertificateError> {
    let have = signers.len();
    if have < quorum {
        return Err(CertificateError::InsufficientSignatures { have, need: quorum });
    }
    if have > n {
        return Err(CertificateError::TooManySignatures { have, max: n });
    }

    let mut seen = vec![false; n];
    for signer in signers {
        let slot = seen
            .get_mut(signer.index())
            .ok_or(CertificateError::SignerOutOfRange(signer))?;
        if std::mem::replace(slot, true) {
            return Err(CertificateError::DuplicateSigner(signer));
        }
    }
    Ok(())
}
