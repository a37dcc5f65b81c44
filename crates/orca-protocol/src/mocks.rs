//! Deterministic collaborators for tests and local clusters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use orca_core::{
    AttributedObservation, ConfigDigest, Observation, OracleId, Outcome, OutcomeContext, Query,
    Quorum, ReportWithInfo, SeqNr,
};
use orca_store::MemoryStorage;

use crate::db::{Database, KvDatabase, PacemakerState};
use crate::error::{DbError, PluginError, TransmitError};
use crate::events::AttributedOnchainSignature;
use crate::messages::Message;
use crate::network::NetworkEndpoint;
use crate::plugin::{ContractTransmitter, ReportingPlugin};
use crate::qc::CertifiedPrepareOrCommit;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Plugin whose outcome is a pure function of the round, recording the
/// calls it receives
pub struct MockPlugin {
    pub quorum: Quorum,
    pub accept_reports: AtomicBool,
    pub transmit_reports: AtomicBool,
    /// Number of upcoming `reports` calls that fail
    pub reports_failures: AtomicUsize,
    outcome_calls: Mutex<Vec<SeqNr>>,
    reports_calls: Mutex<Vec<(SeqNr, Outcome)>>,
}

impl Default for MockPlugin {
    fn default() -> Self {
        MockPlugin {
            quorum: Quorum::TwoFPlusOne,
            accept_reports: AtomicBool::new(true),
            transmit_reports: AtomicBool::new(true),
            reports_failures: AtomicUsize::new(0),
            outcome_calls: Mutex::new(Vec::new()),
            reports_calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockPlugin {
    /// Sequence numbers `outcome` was computed for, in call order
    pub fn outcome_calls(&self) -> Vec<SeqNr> {
        lock(&self.outcome_calls).clone()
    }

    /// Arguments of every `reports` call, in call order
    pub fn reports_calls(&self) -> Vec<(SeqNr, Outcome)> {
        lock(&self.reports_calls).clone()
    }
}

impl ReportingPlugin for MockPlugin {
    type ReportInfo = ();

    async fn query(&self, ctx: &OutcomeContext) -> Result<Query, PluginError> {
        Ok(ctx.seq_nr.to_be_bytes().to_vec())
    }

    async fn observation(
        &self,
        ctx: &OutcomeContext,
        query: &Query,
    ) -> Result<Observation, PluginError> {
        Ok([ctx.seq_nr.to_be_bytes().as_slice(), query.as_slice()].concat())
    }

    async fn validate_observation(
        &self,
        _ctx: &OutcomeContext,
        _query: &Query,
        observation: &AttributedObservation,
    ) -> Result<(), PluginError> {
        if observation.observation.is_empty() {
            return Err(PluginError::new("empty observation"));
        }
        Ok(())
    }

    fn observation_quorum(&self, _ctx: &OutcomeContext, _query: &Query) -> Quorum {
        self.quorum
    }

    async fn outcome(
        &self,
        ctx: &OutcomeContext,
        _query: &Query,
        observations: &[AttributedObservation],
    ) -> Result<Outcome, PluginError> {
        lock(&self.outcome_calls).push(ctx.seq_nr);
        Ok(format!("seq={} observations={}", ctx.seq_nr, observations.len()).into_bytes())
    }

    async fn reports(
        &self,
        seq_nr: SeqNr,
        outcome: &Outcome,
    ) -> Result<Vec<ReportWithInfo<()>>, PluginError> {
        lock(&self.reports_calls).push((seq_nr, outcome.clone()));
        let failing = self
            .reports_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PluginError::new("reports unavailable"));
        }
        Ok(vec![ReportWithInfo {
            report: [b"report:".as_slice(), outcome.as_slice()].concat(),
            info: (),
        }])
    }

    async fn should_accept_attested_report(
        &self,
        _seq_nr: SeqNr,
        _report: &ReportWithInfo<()>,
    ) -> Result<bool, PluginError> {
        Ok(self.accept_reports.load(Ordering::SeqCst))
    }

    async fn should_transmit_accepted_report(
        &self,
        _seq_nr: SeqNr,
        _report: &ReportWithInfo<()>,
    ) -> Result<bool, PluginError> {
        Ok(self.transmit_reports.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmitted {
    pub config_digest: ConfigDigest,
    pub seq_nr: SeqNr,
    pub report: Vec<u8>,
    pub signers: Vec<OracleId>,
}

/// Transmitter that records every report handed to it
#[derive(Default)]
pub struct RecordingTransmitter {
    transmissions: Mutex<Vec<Transmitted>>,
}

impl RecordingTransmitter {
    pub fn transmissions(&self) -> Vec<Transmitted> {
        lock(&self.transmissions).clone()
    }
}

impl<I: Send + Sync> ContractTransmitter<I> for RecordingTransmitter {
    async fn transmit(
        &self,
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<I>,
        signatures: &[AttributedOnchainSignature],
    ) -> Result<(), TransmitError> {
        lock(&self.transmissions).push(Transmitted {
            config_digest,
            seq_nr,
            report: report.report.clone(),
            signers: signatures.iter().map(|s| s.signer).collect(),
        });
        Ok(())
    }

    fn from_account(&self) -> String {
        "recording".to_string()
    }
}

/// Endpoint that records outbound traffic instead of delivering it
#[derive(Default)]
pub struct RecordingEndpoint {
    broadcasts: Mutex<Vec<Message>>,
    sent: Mutex<Vec<(OracleId, Message)>>,
}

impl RecordingEndpoint {
    pub fn broadcasts(&self) -> Vec<Message> {
        lock(&self.broadcasts).clone()
    }

    pub fn sent(&self) -> Vec<(OracleId, Message)> {
        lock(&self.sent).clone()
    }
}

impl NetworkEndpoint for RecordingEndpoint {
    fn send_to(&self, to: OracleId, message: &Message) {
        lock(&self.sent).push((to, message.clone()));
    }

    fn broadcast(&self, message: &Message) {
        lock(&self.broadcasts).push(message.clone());
    }
}

/// In-memory database whose writes can be made to fail
pub struct FlakyDatabase {
    inner: KvDatabase<MemoryStorage>,
    fail_writes: AtomicBool,
}

impl Default for FlakyDatabase {
    fn default() -> Self {
        FlakyDatabase {
            inner: KvDatabase::new(MemoryStorage::new()),
            fail_writes: AtomicBool::new(false),
        }
    }
}

impl FlakyDatabase {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), DbError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DbError::Task("writes disabled".to_string()));
        }
        Ok(())
    }
}

impl Database for FlakyDatabase {
    fn read_state(&self, config_digest: ConfigDigest) -> Result<Option<PacemakerState>, DbError> {
        self.inner.read_state(config_digest)
    }

    fn write_state(
        &self,
        config_digest: ConfigDigest,
        state: &PacemakerState,
    ) -> Result<(), DbError> {
        self.check_writable()?;
        self.inner.write_state(config_digest, state)
    }

    fn read_cert(
        &self,
        config_digest: ConfigDigest,
    ) -> Result<Option<CertifiedPrepareOrCommit>, DbError> {
        self.inner.read_cert(config_digest)
    }

    fn write_cert(
        &self,
        config_digest: ConfigDigest,
        cert: &CertifiedPrepareOrCommit,
    ) -> Result<(), DbError> {
        self.check_writable()?;
        self.inner.write_cert(config_digest, cert)
    }
}
