use orca_core::{ConfigDigest, OracleId, ReportWithInfo, SeqNr};
use orca_protocol::{AttributedOnchainSignature, ContractTransmitter, TransmitError};
use tracing::info;

/// Stands in for a ledger client: logs every report it is handed
pub struct LoggingTransmitter {
    oracle: OracleId,
}

impl LoggingTransmitter {
    pub fn new(oracle: OracleId) -> Self {
        LoggingTransmitter { oracle }
    }
}

impl ContractTransmitter<u64> for LoggingTransmitter {
    async fn transmit(
        &self,
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<u64>,
        signatures: &[AttributedOnchainSignature],
    ) -> Result<(), TransmitError> {
        if signatures.is_empty() {
            return Err(TransmitError("report carries no signatures".to_string()));
        }
        let signers: Vec<String> = signatures.iter().map(|s| s.signer.to_string()).collect();
        info!(
            "[{}] seq {} median {} signed by [{}] (config {})",
            self.oracle,
            seq_nr,
            report.info,
            signers.join(", "),
            config_digest
        );
        Ok(())
    }

    fn from_account(&self) -> String {
        format!("oracle-{}", self.oracle)
    }
}
