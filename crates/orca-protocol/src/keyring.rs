use orca_core::{sign, verify, ConfigDigest, DigestBuilder, KeyPair, PublicKey, SeqNr, Sig};

use crate::error::KeyringError;
use orca_core::ReportWithInfo;

/// Signs protocol-internal messages
pub trait OffchainKeyring: Send + Sync {
    fn sign(&self, message: &[u8]) -> Sig;

    fn public_key(&self) -> PublicKey;
}

impl OffchainKeyring for KeyPair {
    fn sign(&self, message: &[u8]) -> Sig {
        sign(&self.secret, message)
    }

    fn public_key(&self) -> PublicKey {
        self.public
    }
}

pub type OnchainPublicKey = Vec<u8>;

/// Signs reports in the scheme the target ledger verifies
pub trait OnchainKeyring<I>: Send + Sync {
    fn public_key(&self) -> OnchainPublicKey;

    fn sign(
        &self,
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<I>,
    ) -> Result<Vec<u8>, KeyringError>;

    fn verify(
        &self,
        public_key: &[u8],
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<I>,
        signature: &[u8],
    ) -> bool;

    fn max_signature_length(&self) -> usize;
}

/// Onchain keyring signing report digests with Ed25519.
///
/// The report info is not covered by the signature; only the report bytes
/// reach the ledger.
#[derive(Debug, Clone)]
pub struct Ed25519OnchainKeyring {
    keypair: KeyPair,
}

impl Ed25519OnchainKeyring {
    pub fn new(keypair: KeyPair) -> Self {
        Ed25519OnchainKeyring { keypair }
    }

    fn report_digest(config_digest: ConfigDigest, seq_nr: SeqNr, report: &[u8]) -> [u8; 32] {
        *DigestBuilder::new(b"orca/onchain-report")
            .bytes(config_digest.as_bytes())
            .u64(seq_nr)
            .bytes(report)
            .finish()
            .as_bytes()
    }
}

impl<I> OnchainKeyring<I> for Ed25519OnchainKeyring {
    fn public_key(&self) -> OnchainPublicKey {
        self.keypair.public.as_bytes().to_vec()
    }

    fn sign(
        &self,
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<I>,
    ) -> Result<Vec<u8>, KeyringError> {
        let digest = Self::report_digest(config_digest, seq_nr, &report.report);
        Ok(sign(&self.keypair.secret, &digest).as_bytes().to_vec())
    }

    fn verify(
        &self,
        public_key: &[u8],
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<I>,
        signature: &[u8],
    ) -> bool {
        let (Some(public_key), Some(signature)) =
            (PublicKey::from_slice(public_key), Sig::from_slice(signature))
        else {
            return false;
        };
        let digest = Self::report_digest(config_digest, seq_nr, &report.report);
        verify(&public_key, &digest, &signature).is_ok()
    }

    fn max_signature_length(&self) -> usize {
        orca_core::crypto::SIGNATURE_LENGTH
    }
}
