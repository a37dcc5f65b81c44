//! Threshold attestation of committed outcomes.
//!
//! Every oracle signs the reports of each committed outcome with its onchain
//! key and gossips the signatures. Once F+1 batches verify, the reports are
//! attested and handed to transmission. Oracles that missed a commit fetch
//! the certified commit from a peer that signed it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use orca_core::{OracleId, Outcome, ReportWithInfo, SeqNr};
use rand::seq::IteratorRandom;
use rayon::prelude::*;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AttestationWindow;
use crate::error::ProtocolError;
use crate::events::{AttestedReport, AttributedOnchainSignature, CommittedOutcome};
use crate::keyring::{OnchainKeyring, OnchainPublicKey};
use crate::messages::{Message, ReportAttestationMessage};
use crate::oracle::OracleContext;
use crate::plugin::{call_plugin, ReportingPlugin};
use crate::qc::CertifiedCommit;
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStatus {
    Pending,
    Verifying,
    Valid,
    Invalid,
}

#[derive(Debug)]
struct Batch {
    signatures: Arc<Vec<Vec<u8>>>,
    status: BatchStatus,
}

struct Round<I> {
    certified_commit: Option<CertifiedCommit>,
    reports: Option<Arc<Vec<ReportWithInfo<I>>>>,
    batches: BTreeMap<OracleId, Batch>,
    requested_from: BTreeSet<OracleId>,
    /// When to re-request the certified commit, or re-sign if it is known
    repair_deadline: Option<Instant>,
    complete: bool,
}

impl<I> Default for Round<I> {
    fn default() -> Self {
        Round {
            certified_commit: None,
            reports: None,
            batches: BTreeMap::new(),
            requested_from: BTreeSet::new(),
            repair_deadline: None,
            complete: false,
        }
    }
}

/// Verdicts for the batches of one round, produced on the verifier pool
#[derive(Debug)]
struct Verification {
    seq_nr: SeqNr,
    results: Vec<(OracleId, bool)>,
}

pub struct ReportAttestation<P: ReportingPlugin> {
    ctx: OracleContext,
    plugin: Arc<P>,
    keyring: Arc<dyn OnchainKeyring<P::ReportInfo>>,
    onchain_keys: Arc<Vec<OnchainPublicKey>>,
    verifier: Arc<rayon::ThreadPool>,

    inbox: mpsc::Receiver<(OracleId, ReportAttestationMessage)>,
    from_outcome_generation: mpsc::Receiver<CommittedOutcome>,
    to_transmission: mpsc::Sender<AttestedReport<P::ReportInfo>>,
    verified_tx: mpsc::UnboundedSender<Verification>,
    verified_rx: mpsc::UnboundedReceiver<Verification>,

    rounds: BTreeMap<SeqNr, Round<P::ReportInfo>>,
    highest_attested: SeqNr,
    highest_known: SeqNr,
    window: AttestationWindow,
    repair_timer: Timer,
    reap_timer: Timer,
}

impl<P: ReportingPlugin> ReportAttestation<P> {
    pub(crate) fn new(
        ctx: OracleContext,
        plugin: Arc<P>,
        keyring: Arc<dyn OnchainKeyring<P::ReportInfo>>,
        verifier: Arc<rayon::ThreadPool>,
        inbox: mpsc::Receiver<(OracleId, ReportAttestationMessage)>,
        from_outcome_generation: mpsc::Receiver<CommittedOutcome>,
        to_transmission: mpsc::Sender<AttestedReport<P::ReportInfo>>,
    ) -> Self {
        let onchain_keys = ctx
            .config
            .oracles
            .iter()
            .map(|identity| identity.onchain_public_key.clone())
            .collect();
        let window = AttestationWindow::new(&ctx.config, &ctx.local);
        let (verified_tx, verified_rx) = mpsc::unbounded_channel();
        ReportAttestation {
            ctx,
            plugin,
            keyring,
            onchain_keys: Arc::new(onchain_keys),
            verifier,
            inbox,
            from_outcome_generation,
            to_transmission,
            verified_tx,
            verified_rx,
            rounds: BTreeMap::new(),
            highest_attested: 0,
            highest_known: 0,
            window,
            repair_timer: Timer::new(),
            reap_timer: Timer::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        self.reap_timer.arm(self.ctx.local.reap_interval());
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                Some(committed) = self.from_outcome_generation.recv() => {
                    self.on_committed(committed.certified_commit).await?;
                }
                Some((sender, message)) = self.inbox.recv() => {
                    self.handle_message(sender, message).await?;
                }
                Some(verification) = self.verified_rx.recv() => {
                    self.on_verified(verification).await?;
                }
                _ = self.repair_timer.expired() => self.on_repair_timer().await,
                _ = self.reap_timer.expired() => {
                    self.reap();
                    self.reap_timer.arm(self.ctx.local.reap_interval());
                }
            }
        }
        debug!(
            "Report attestation of {} stopped, highest attested seq {}",
            self.ctx.id, self.highest_attested
        );
        Ok(())
    }

    fn in_window(&self, seq_nr: SeqNr) -> bool {
        seq_nr >= self.window.lower_bound(self.highest_attested)
            && seq_nr <= self.window.upper_bound(self.highest_known)
    }

    fn send_to(&self, to: OracleId, message: ReportAttestationMessage) {
        self.ctx.network.send_to(to, &Message::from(message));
    }

    async fn on_committed(&mut self, certified_commit: CertifiedCommit) -> Result<(), ProtocolError> {
        self.highest_known = self.highest_known.max(certified_commit.seq_nr);
        if !self.in_window(certified_commit.seq_nr) {
            return Ok(());
        }
        self.process_certified_commit(certified_commit).await
    }

    pub(crate) async fn handle_message(
        &mut self,
        sender: OracleId,
        message: ReportAttestationMessage,
    ) -> Result<(), ProtocolError> {
        match message {
            ReportAttestationMessage::ReportSignatures {
                seq_nr,
                report_signatures,
            } => self.on_report_signatures(sender, seq_nr, report_signatures),
            ReportAttestationMessage::CertifiedCommitRequest { seq_nr } => {
                self.on_certified_commit_request(sender, seq_nr);
                Ok(())
            }
            ReportAttestationMessage::CertifiedCommit { certified_commit } => {
                self.on_certified_commit(sender, certified_commit).await
            }
        }
    }

    fn on_report_signatures(
        &mut self,
        sender: OracleId,
        seq_nr: SeqNr,
        signatures: Vec<Vec<u8>>,
    ) -> Result<(), ProtocolError> {
        if !self.in_window(seq_nr) {
            debug!(
                "Dropping report signatures for seq {} from {} outside the window",
                seq_nr, sender
            );
            return Ok(());
        }
        let round = self.rounds.entry(seq_nr).or_default();
        if round.complete || round.batches.contains_key(&sender) {
            return Ok(());
        }
        round.batches.insert(
            sender,
            Batch {
                signatures: Arc::new(signatures),
                status: BatchStatus::Pending,
            },
        );

        if round.reports.is_some() {
            self.verify_pending(seq_nr);
        } else if round.certified_commit.is_none()
            && round.repair_deadline.is_none()
            && round.batches.len() > self.ctx.config.f
        {
            self.request_certified_commit(seq_nr);
        }
        Ok(())
    }

    fn on_certified_commit_request(&self, sender: OracleId, seq_nr: SeqNr) {
        let certified_commit = self
            .rounds
            .get(&seq_nr)
            .and_then(|round| round.certified_commit.clone());
        match certified_commit {
            Some(certified_commit) => self.send_to(
                sender,
                ReportAttestationMessage::CertifiedCommit { certified_commit },
            ),
            None => debug!(
                "No certified commit for seq {} requested by {}",
                seq_nr, sender
            ),
        }
    }

    async fn on_certified_commit(
        &mut self,
        sender: OracleId,
        certified_commit: CertifiedCommit,
    ) -> Result<(), ProtocolError> {
        let seq_nr = certified_commit.seq_nr;
        let wanted = self
            .rounds
            .get(&seq_nr)
            .is_some_and(|round| round.certified_commit.is_none());
        if !wanted || !self.in_window(seq_nr) {
            return Ok(());
        }
        let config = &self.ctx.config;
        if let Err(e) = certified_commit.verify(
            config.config_digest,
            &config.offchain_public_keys(),
            config.byz_quorum_size(),
        ) {
            debug!(
                "Dropping certified commit for seq {} from {}: {}",
                seq_nr, sender, e
            );
            return Ok(());
        }
        debug!("Fetched certified commit for seq {} from {}", seq_nr, sender);
        self.process_certified_commit(certified_commit).await
    }

    /// Record a verified certified commit and sign its reports
    async fn process_certified_commit(
        &mut self,
        certified_commit: CertifiedCommit,
    ) -> Result<(), ProtocolError> {
        let seq_nr = certified_commit.seq_nr;
        let round = self.rounds.entry(seq_nr).or_default();
        if round.certified_commit.is_some() {
            return Ok(());
        }
        round.repair_deadline = None;
        round.certified_commit = Some(certified_commit);
        self.sign_reports(seq_nr).await;
        self.arm_repair_timer();
        Ok(())
    }

    /// Sign and gossip the reports of a round whose certified commit is
    /// known. A failed attempt is repeated once the round's repair deadline
    /// passes.
    async fn sign_reports(&mut self, seq_nr: SeqNr) {
        let outcome = self
            .rounds
            .get(&seq_nr)
            .filter(|round| round.reports.is_none())
            .and_then(|round| round.certified_commit.as_ref())
            .map(|certified_commit| certified_commit.outcome.clone());
        let Some(outcome) = outcome else {
            return;
        };

        let signed = self.signed_reports(seq_nr, &outcome).await;
        let retry_at = Instant::now() + self.ctx.config.delta_certified_commit_request();
        let Some(round) = self.rounds.get_mut(&seq_nr) else {
            return;
        };
        let Some((reports, signatures)) = signed else {
            debug!(
                "Oracle {} will retry signing reports of seq {}",
                self.ctx.id, seq_nr
            );
            round.repair_deadline = Some(retry_at);
            return;
        };
        round.reports = Some(Arc::new(reports));
        round.repair_deadline = None;

        debug!(
            "Oracle {} signed {} reports for seq {}",
            self.ctx.id,
            signatures.len(),
            seq_nr
        );
        self.ctx.network.broadcast(&Message::from(
            ReportAttestationMessage::ReportSignatures {
                seq_nr,
                report_signatures: signatures,
            },
        ));
        self.verify_pending(seq_nr);
    }

    /// The plugin's reports for `outcome` and this oracle's signature over
    /// each, or `None` if either step failed
    async fn signed_reports(
        &self,
        seq_nr: SeqNr,
        outcome: &Outcome,
    ) -> Option<(Vec<ReportWithInfo<P::ReportInfo>>, Vec<Vec<u8>>)> {
        let reports = call_plugin(
            "reports",
            self.ctx.local.max_duration_reports(),
            self.plugin.reports(seq_nr, outcome),
        )
        .await?;
        if reports.len() > self.ctx.config.max_report_count {
            warn!(
                "Plugin produced {} reports for seq {}, limit is {}",
                reports.len(),
                seq_nr,
                self.ctx.config.max_report_count
            );
            return None;
        }

        let cd = self.ctx.config.config_digest;
        let mut signatures = Vec::with_capacity(reports.len());
        for report in &reports {
            match self.keyring.sign(cd, seq_nr, report) {
                Ok(signature) => signatures.push(signature),
                Err(e) => {
                    error!("Oracle {} cannot sign reports of seq {}: {}", self.ctx.id, seq_nr, e);
                    return None;
                }
            }
        }
        Some((reports, signatures))
    }

    /// Ship the round's unverified batches to the verifier pool
    fn verify_pending(&mut self, seq_nr: SeqNr) {
        let Some(round) = self.rounds.get_mut(&seq_nr) else {
            return;
        };
        let Some(reports) = round.reports.clone() else {
            return;
        };
        let jobs: Vec<(OracleId, Arc<Vec<Vec<u8>>>)> = round
            .batches
            .iter_mut()
            .filter(|(_, batch)| batch.status == BatchStatus::Pending)
            .map(|(signer, batch)| {
                batch.status = BatchStatus::Verifying;
                (*signer, batch.signatures.clone())
            })
            .collect();
        if jobs.is_empty() {
            return;
        }

        let keyring = self.keyring.clone();
        let keys = self.onchain_keys.clone();
        let cd = self.ctx.config.config_digest;
        let results = self.verified_tx.clone();
        self.verifier.spawn(move || {
            let results_for_round: Vec<(OracleId, bool)> = jobs
                .par_iter()
                .map(|(signer, signatures)| {
                    let valid = keys.get(signer.index()).is_some_and(|key| {
                        signatures.len() == reports.len()
                            && reports
                                .iter()
                                .zip(signatures.iter())
                                .all(|(report, signature)| {
                                    keyring.verify(key, cd, seq_nr, report, signature)
                                })
                    });
                    (*signer, valid)
                })
                .collect();
            // the receiver is gone only during shutdown
            let _ = results.send(Verification {
                seq_nr,
                results: results_for_round,
            });
        });
    }

    async fn on_verified(&mut self, verification: Verification) -> Result<(), ProtocolError> {
        let Some(round) = self.rounds.get_mut(&verification.seq_nr) else {
            return Ok(());
        };
        for (signer, valid) in verification.results {
            if let Some(batch) = round.batches.get_mut(&signer) {
                batch.status = if valid {
                    BatchStatus::Valid
                } else {
                    debug!(
                        "Invalid report signatures for seq {} from {}",
                        verification.seq_nr, signer
                    );
                    BatchStatus::Invalid
                };
            }
        }
        self.try_complete(verification.seq_nr).await
    }

    async fn try_complete(&mut self, seq_nr: SeqNr) -> Result<(), ProtocolError> {
        let threshold = self.ctx.config.f + 1;
        let Some(round) = self.rounds.get_mut(&seq_nr) else {
            return Ok(());
        };
        if round.complete {
            return Ok(());
        }
        let Some(reports) = round.reports.clone() else {
            return Ok(());
        };
        let signers: Vec<(OracleId, Arc<Vec<Vec<u8>>>)> = round
            .batches
            .iter()
            .filter(|(_, batch)| batch.status == BatchStatus::Valid)
            .map(|(signer, batch)| (*signer, batch.signatures.clone()))
            .take(threshold)
            .collect();
        if signers.len() < threshold {
            return Ok(());
        }
        round.complete = true;
        self.highest_attested = self.highest_attested.max(seq_nr);
        self.highest_known = self.highest_known.max(seq_nr);

        info!(
            "Oracle {} attested {} reports for seq {}",
            self.ctx.id,
            reports.len(),
            seq_nr
        );
        for (index, report) in reports.iter().enumerate() {
            let signatures = signers
                .iter()
                .map(|(signer, batch)| AttributedOnchainSignature {
                    signature: batch[index].clone(),
                    signer: *signer,
                })
                .collect();
            self.to_transmission
                .send(AttestedReport {
                    seq_nr,
                    index,
                    report: report.clone(),
                    signatures,
                })
                .await
                .map_err(|_| ProtocolError::ChannelClosed("transmission"))?;
        }
        Ok(())
    }

    /// Ask a random peer that signed the round for its certified commit
    fn request_certified_commit(&mut self, seq_nr: SeqNr) {
        let id = self.ctx.id;
        let deadline = Instant::now() + self.ctx.config.delta_certified_commit_request();
        let Some(round) = self.rounds.get_mut(&seq_nr) else {
            return;
        };
        let mut rng = rand::thread_rng();
        let untried = round
            .batches
            .keys()
            .copied()
            .filter(|peer| *peer != id && !round.requested_from.contains(peer))
            .choose(&mut rng);
        let peer = match untried {
            Some(peer) => peer,
            None => {
                // everyone was asked once; start over
                round.requested_from.clear();
                match round
                    .batches
                    .keys()
                    .copied()
                    .filter(|peer| *peer != id)
                    .choose(&mut rng)
                {
                    Some(peer) => peer,
                    None => return,
                }
            }
        };
        round.requested_from.insert(peer);
        round.repair_deadline = Some(deadline);
        debug!(
            "Oracle {} requesting certified commit for seq {} from {}",
            id, seq_nr, peer
        );
        self.send_to(peer, ReportAttestationMessage::CertifiedCommitRequest { seq_nr });
        self.arm_repair_timer();
    }

    fn arm_repair_timer(&mut self) {
        match self.rounds.values().filter_map(|round| round.repair_deadline).min() {
            Some(deadline) => self.repair_timer.arm_at(deadline),
            None => self.repair_timer.cancel(),
        }
    }

    /// Retry rounds stuck without a certified commit or without signed reports
    async fn on_repair_timer(&mut self) {
        let now = Instant::now();
        let overdue: Vec<(SeqNr, bool)> = self
            .rounds
            .iter()
            .filter(|(_, round)| {
                round.reports.is_none()
                    && round.repair_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(seq_nr, round)| (*seq_nr, round.certified_commit.is_some()))
            .collect();
        for (seq_nr, known) in overdue {
            if known {
                self.sign_reports(seq_nr).await;
            } else {
                self.request_certified_commit(seq_nr);
            }
        }
        self.arm_repair_timer();
    }

    /// Forget rounds that fell below the attestation window
    fn reap(&mut self) {
        let lower_bound = self.window.lower_bound(self.highest_attested);
        let before = self.rounds.len();
        self.rounds = self.rounds.split_off(&lower_bound);
        let reaped = before - self.rounds.len();
        if reaped > 0 {
            debug!(
                "Oracle {} reaped {} attestation rounds below seq {}",
                self.ctx.id, reaped, lower_bound
            );
        }
    }
}
