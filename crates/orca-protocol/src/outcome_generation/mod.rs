//! Agreement on one outcome per sequence number.
//!
//! Every oracle runs both roles. The follower role observes, prepares and
//! commits; the leader role is only active on the current epoch's leader and
//! drives rounds forward. Certified state is persisted before anything that
//! depends on it is sent.

mod follower;
mod leader;

use std::sync::Arc;

use orca_core::{Epoch, OracleId, Outcome, OutcomeContext, PublicKey, SeqNr};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::ProtocolError;
use crate::events::{CommittedOutcome, EpochStartEvent, PacemakerEvent};
use crate::keyring::OffchainKeyring;
use crate::messages::{Message, OutcomeGenerationMessage};
use crate::oracle::OracleContext;
use crate::plugin::ReportingPlugin;
use crate::pool::FutureEpochBuffer;
use crate::qc::{CertifiedCommit, CertifiedPrepareOrCommit};
use crate::signed_data::{
    HighestCertifiedTimestamp, OutcomeGenerationId, SignedHighestCertifiedTimestamp,
};

use follower::FollowerState;
use leader::LeaderState;

/// Prepare and commit pools accept this many sequence numbers past the last
/// delivered one
const POOL_WINDOW: u64 = 4;

pub struct OutcomeGeneration<P: ReportingPlugin> {
    ctx: OracleContext,
    plugin: Arc<P>,
    keyring: Arc<dyn OffchainKeyring>,
    keys: Vec<PublicKey>,

    inbox: mpsc::Receiver<(OracleId, OutcomeGenerationMessage)>,
    from_pacemaker: mpsc::Receiver<EpochStartEvent>,
    to_pacemaker: mpsc::Sender<PacemakerEvent>,
    to_report_attestation: mpsc::Sender<CommittedOutcome>,

    epoch: Epoch,
    leader: OracleId,
    /// Highest certified state, mirrored in the database
    highest_certified: CertifiedPrepareOrCommit,
    /// Last sequence number handed to report attestation
    delivered_seq_nr: SeqNr,
    /// Outcome committed at `delivered_seq_nr`
    delivered_outcome: Outcome,
    change_leader_requested: bool,

    follower: FollowerState,
    leader_state: LeaderState,
    future_messages: FutureEpochBuffer,
}

impl<P: ReportingPlugin> OutcomeGeneration<P> {
    pub(crate) fn new(
        ctx: OracleContext,
        plugin: Arc<P>,
        keyring: Arc<dyn OffchainKeyring>,
        inbox: mpsc::Receiver<(OracleId, OutcomeGenerationMessage)>,
        from_pacemaker: mpsc::Receiver<EpochStartEvent>,
        to_pacemaker: mpsc::Sender<PacemakerEvent>,
        to_report_attestation: mpsc::Sender<CommittedOutcome>,
    ) -> Self {
        let n = ctx.config.n();
        let keys = ctx.config.offchain_public_keys();
        let future_messages = FutureEpochBuffer::new(n, ctx.local.epoch_buffer_capacity);
        OutcomeGeneration {
            ctx,
            plugin,
            keyring,
            keys,
            inbox,
            from_pacemaker,
            to_pacemaker,
            to_report_attestation,
            epoch: 0,
            leader: OracleId(0),
            highest_certified: CertifiedPrepareOrCommit::genesis(),
            delivered_seq_nr: 0,
            delivered_outcome: Vec::new(),
            change_leader_requested: false,
            follower: FollowerState::new(0),
            leader_state: LeaderState::default(),
            future_messages,
        }
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let cd = self.ctx.config.config_digest;
        let restored = db::restore(
            &self.ctx.database,
            self.ctx.local.database_timeout(),
            self.ctx.local.persist_retry_backoff(),
            &self.ctx.cancel,
            "certified state",
            move |db| db.read_cert(cd),
        )
        .await
        .map_err(ProtocolError::Restore)?;
        let Some(restored) = restored else {
            return Ok(());
        };
        if let Some(cert) = restored {
            self.restore(cert);
        }

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                Some(event) = self.from_pacemaker.recv() => {
                    self.handle_epoch_start(event).await?;
                }
                Some((sender, message)) = self.inbox.recv() => {
                    self.handle_message(sender, message).await?;
                }
                _ = self.leader_state.round_timer.expired() => self.on_round_timer().await?,
                _ = self.leader_state.grace_timer.expired() => self.on_grace_timer(),
            }
        }

        debug!(
            "Outcome generation of {} stopped in epoch {} after seq {}",
            self.ctx.id, self.epoch, self.delivered_seq_nr
        );
        Ok(())
    }

    fn restore(&mut self, cert: CertifiedPrepareOrCommit) {
        match &cert {
            CertifiedPrepareOrCommit::Commit(cc) => {
                self.delivered_seq_nr = cc.seq_nr;
                self.delivered_outcome = cc.outcome.clone();
            }
            CertifiedPrepareOrCommit::Prepare(cp) => {
                self.delivered_seq_nr = cp.seq_nr.saturating_sub(1);
            }
        }
        info!(
            "Oracle {} restored certified state at {:?}",
            self.ctx.id,
            cert.timestamp()
        );
        self.highest_certified = cert;
    }

    fn ogid(&self) -> OutcomeGenerationId {
        OutcomeGenerationId::new(self.ctx.config.config_digest, self.epoch)
    }

    fn is_leader(&self) -> bool {
        self.leader == self.ctx.id
    }

    fn outcome_context(&self, seq_nr: SeqNr) -> OutcomeContext {
        OutcomeContext {
            seq_nr,
            previous_outcome: self.delivered_outcome.clone(),
            epoch: self.epoch,
            round: seq_nr.saturating_sub(self.follower.first_seq_nr) + 1,
        }
    }

    fn public_key(&self, id: OracleId) -> Result<&PublicKey, ProtocolError> {
        self.keys.get(id.index()).ok_or_else(|| {
            ProtocolError::Invariant(format!("no offchain key for sender {}", id))
        })
    }

    fn broadcast(&self, message: OutcomeGenerationMessage) {
        self.ctx.network.broadcast(&Message::from(message));
    }

    fn send_to(&self, to: OracleId, message: OutcomeGenerationMessage) {
        self.ctx.network.send_to(to, &Message::from(message));
    }

    pub(crate) async fn handle_epoch_start(
        &mut self,
        event: EpochStartEvent,
    ) -> Result<(), ProtocolError> {
        if event.epoch <= self.epoch {
            debug!("Ignoring stale epoch start {}", event.epoch);
            return Ok(());
        }
        self.epoch = event.epoch;
        self.leader = event.leader;
        self.change_leader_requested = false;
        self.follower = FollowerState::new(self.delivered_seq_nr);
        self.leader_state.reset();

        let ogid = self.ogid();
        let signed_timestamp = SignedHighestCertifiedTimestamp::sign(
            ogid,
            self.highest_certified_timestamp(),
            self.keyring.as_ref(),
        );
        debug!(
            "Oracle {} requesting epoch start {} from {}",
            self.ctx.id, self.epoch, self.leader
        );
        self.send_to(
            self.leader,
            OutcomeGenerationMessage::EpochStartRequest {
                epoch: self.epoch,
                highest_certified: self.highest_certified.clone(),
                signed_highest_certified_timestamp: signed_timestamp,
            },
        );

        for (sender, message) in self.future_messages.take_ready(self.epoch) {
            self.process_message(sender, message).await?;
        }
        Ok(())
    }

    pub(crate) async fn handle_message(
        &mut self,
        sender: OracleId,
        message: OutcomeGenerationMessage,
    ) -> Result<(), ProtocolError> {
        let epoch = message.epoch();
        if epoch < self.epoch {
            debug!(
                "Dropping {} for past epoch {} from {}",
                message.kind(),
                epoch,
                sender
            );
            return Ok(());
        }
        if epoch > self.epoch {
            self.future_messages.push(sender, message);
            return Ok(());
        }
        self.process_message(sender, message).await
    }

    async fn process_message(
        &mut self,
        sender: OracleId,
        message: OutcomeGenerationMessage,
    ) -> Result<(), ProtocolError> {
        match message {
            OutcomeGenerationMessage::EpochStartRequest {
                highest_certified,
                signed_highest_certified_timestamp,
                ..
            } => {
                self.on_epoch_start_request(
                    sender,
                    highest_certified,
                    signed_highest_certified_timestamp,
                )?;
            }
            OutcomeGenerationMessage::EpochStart {
                epoch_start_proof, ..
            } => {
                self.on_epoch_start(sender, epoch_start_proof).await?;
            }
            OutcomeGenerationMessage::RoundStart { seq_nr, query, .. } => {
                self.on_round_start(sender, seq_nr, query).await?;
            }
            OutcomeGenerationMessage::Observation {
                seq_nr,
                signed_observation,
                ..
            } => {
                self.on_observation(sender, seq_nr, signed_observation)
                    .await?;
            }
            OutcomeGenerationMessage::Proposal {
                seq_nr,
                attributed_signed_observations,
                ..
            } => {
                self.on_proposal(sender, seq_nr, attributed_signed_observations)
                    .await?;
            }
            OutcomeGenerationMessage::Prepare {
                seq_nr, signature, ..
            } => {
                self.on_prepare(sender, seq_nr, signature).await?;
            }
            OutcomeGenerationMessage::Commit {
                seq_nr, signature, ..
            } => {
                self.on_commit(sender, seq_nr, signature).await?;
            }
        }
        Ok(())
    }

    /// Persist `cert` if it is newer than what the database holds, retrying
    /// with backoff. Returns false if the instance was cancelled first.
    async fn persist(&mut self, cert: CertifiedPrepareOrCommit) -> bool {
        if cert.timestamp() <= self.highest_certified.timestamp() {
            return true;
        }
        let cd = self.ctx.config.config_digest;
        let backoff = self.ctx.local.persist_retry_backoff();
        let mut delay = backoff;
        loop {
            let record = cert.clone();
            let result = db::with_timeout(
                &self.ctx.database,
                self.ctx.local.database_timeout(),
                move |db| db.write_cert(cd, &record),
            )
            .await;
            match result {
                Ok(()) => {
                    self.highest_certified = cert;
                    return true;
                }
                Err(e) => warn!(
                    "Oracle {} failed to persist certified state {:?}, retrying in {}ms: {}",
                    self.ctx.id,
                    cert.timestamp(),
                    delay.as_millis(),
                    e
                ),
            }
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(backoff * 32);
        }
    }

    /// Persist a certified commit and hand it on if it is new.
    ///
    /// Returns false if the instance was cancelled before the commit became
    /// durable.
    async fn commit(&mut self, certified_commit: CertifiedCommit) -> Result<bool, ProtocolError> {
        if !self
            .persist(CertifiedPrepareOrCommit::Commit(certified_commit.clone()))
            .await
        {
            return Ok(false);
        }
        if certified_commit.is_genesis() || certified_commit.seq_nr <= self.delivered_seq_nr {
            return Ok(true);
        }

        info!(
            "Oracle {} committed seq {} in epoch {}",
            self.ctx.id, certified_commit.seq_nr, certified_commit.commit_epoch
        );
        self.delivered_seq_nr = certified_commit.seq_nr;
        self.delivered_outcome = certified_commit.outcome.clone();
        self.to_report_attestation
            .send(CommittedOutcome { certified_commit })
            .await
            .map_err(|_| ProtocolError::ChannelClosed("report attestation"))?;
        Ok(true)
    }

    async fn notify_pacemaker(&mut self, event: PacemakerEvent) -> Result<(), ProtocolError> {
        if let PacemakerEvent::ChangeLeader { .. } = event {
            if self.change_leader_requested {
                return Ok(());
            }
            self.change_leader_requested = true;
        }
        self.to_pacemaker
            .send(event)
            .await
            .map_err(|_| ProtocolError::ChannelClosed("pacemaker"))
    }

    fn highest_certified_timestamp(&self) -> HighestCertifiedTimestamp {
        self.highest_certified.timestamp()
    }
}

#[cfg(test)]
mod tests {
    use orca_core::{ConfigDigest, KeyPair, Query};

    use super::follower::FollowerPhase;
    use super::leader::LeaderPhase;
    use super::*;
    use crate::config::tests::shared_config;
    use crate::config::SharedConfig;
    use crate::db::Database;
    use crate::mocks::{FlakyDatabase, MockPlugin, RecordingEndpoint};
    use crate::qc::{CertifiedPrepare, EpochStartProof};
    use crate::signed_data::{
        outcome_digest, outcome_inputs_digest, AttributedCommitSignature,
        AttributedPrepareSignature, AttributedSignedHighestCertifiedTimestamp,
        AttributedSignedObservation, CommitSignature, PrepareSignature, SignedObservation,
    };

    const CD: ConfigDigest = ConfigDigest([1u8; 32]);

    struct Harness {
        og: OutcomeGeneration<MockPlugin>,
        endpoint: Arc<RecordingEndpoint>,
        database: Arc<FlakyDatabase>,
        pacemaker_events: mpsc::Receiver<PacemakerEvent>,
        committed: mpsc::Receiver<CommittedOutcome>,
    }

    fn key(i: u8) -> KeyPair {
        KeyPair::derive(b"cfg", "offchain", i as u64)
    }

    fn ogid(epoch: Epoch) -> OutcomeGenerationId {
        OutcomeGenerationId::new(CD, epoch)
    }

    fn harness(id: u8) -> Harness {
        harness_with(id, shared_config(4, 1))
    }

    fn harness_with(id: u8, config: SharedConfig) -> Harness {
        let endpoint = Arc::new(RecordingEndpoint::default());
        let database = Arc::new(FlakyDatabase::default());
        let mut ctx =
            crate::oracle::tests::context(4, 1, OracleId(id), endpoint.clone(), database.clone());
        ctx.config = Arc::new(config);
        let (_inbox_tx, inbox) = mpsc::channel(16);
        let (_pacemaker_tx, from_pacemaker) = mpsc::channel(16);
        let (to_pacemaker, pacemaker_events) = mpsc::channel(16);
        let (to_report_attestation, committed) = mpsc::channel(16);
        let og = OutcomeGeneration::new(
            ctx,
            Arc::new(MockPlugin::default()),
            Arc::new(key(id)),
            inbox,
            from_pacemaker,
            to_pacemaker,
            to_report_attestation,
        );
        Harness {
            og,
            endpoint,
            database,
            pacemaker_events,
            committed,
        }
    }

    fn query(seq_nr: SeqNr) -> Query {
        seq_nr.to_be_bytes().to_vec()
    }

    /// Observations as the mock plugin makes them, each signed by `signer`
    fn observations(
        epoch: Epoch,
        seq_nr: SeqNr,
        observers: &[(u8, u8)],
    ) -> Vec<AttributedSignedObservation> {
        let query = query(seq_nr);
        observers
            .iter()
            .map(|(observer, signer)| AttributedSignedObservation {
                signed_observation: SignedObservation::sign(
                    ogid(epoch),
                    seq_nr,
                    &query,
                    [seq_nr.to_be_bytes().as_slice(), query.as_slice()].concat(),
                    &key(*signer),
                ),
                observer: OracleId(*observer),
            })
            .collect()
    }

    fn honest(observers: &[u8]) -> Vec<(u8, u8)> {
        observers.iter().map(|i| (*i, *i)).collect()
    }

    fn certified_commit(seq_nr: SeqNr, epoch: Epoch, outcome: &[u8]) -> CertifiedCommit {
        let digest = outcome_digest(outcome);
        CertifiedCommit {
            commit_epoch: epoch,
            seq_nr,
            outcome: outcome.to_vec(),
            commit_quorum_certificate: (0..3u8)
                .map(|i| AttributedCommitSignature {
                    signature: CommitSignature::sign(ogid(epoch), seq_nr, &digest, &key(i)),
                    signer: OracleId(i),
                })
                .collect(),
        }
    }

    fn certified_prepare(seq_nr: SeqNr, epoch: Epoch, outcome: &[u8]) -> CertifiedPrepare {
        let inputs = outcome_digest(b"inputs");
        let digest = outcome_digest(outcome);
        CertifiedPrepare {
            prepare_epoch: epoch,
            seq_nr,
            outcome_inputs_digest: inputs,
            outcome: outcome.to_vec(),
            prepare_quorum_certificate: (0..3u8)
                .map(|i| AttributedPrepareSignature {
                    signature: PrepareSignature::sign(
                        ogid(epoch),
                        seq_nr,
                        &inputs,
                        &digest,
                        &key(i),
                    ),
                    signer: OracleId(i),
                })
                .collect(),
        }
    }

    /// Proof for `highest`, with each signer reporting the given timestamp
    fn epoch_start_proof(
        epoch: Epoch,
        highest: CertifiedPrepareOrCommit,
        reported: &[(u8, HighestCertifiedTimestamp)],
    ) -> EpochStartProof {
        EpochStartProof {
            highest_certified: highest,
            highest_certified_proof: reported
                .iter()
                .map(|(signer, timestamp)| AttributedSignedHighestCertifiedTimestamp {
                    signed_timestamp: SignedHighestCertifiedTimestamp::sign(
                        ogid(epoch),
                        *timestamp,
                        &key(*signer),
                    ),
                    signer: OracleId(*signer),
                })
                .collect(),
        }
    }

    fn unanimous(epoch: Epoch, highest: CertifiedPrepareOrCommit) -> EpochStartProof {
        let timestamp = highest.timestamp();
        epoch_start_proof(epoch, highest, &[(1, timestamp), (2, timestamp), (3, timestamp)])
    }

    async fn deliver(h: &mut Harness, sender: u8, message: OutcomeGenerationMessage) {
        h.og.handle_message(OracleId(sender), message).await.unwrap();
    }

    fn broadcasts(h: &Harness) -> Vec<OutcomeGenerationMessage> {
        h.endpoint
            .broadcasts()
            .into_iter()
            .filter_map(|message| match message {
                Message::OutcomeGeneration(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn round_starts(h: &Harness) -> usize {
        broadcasts(h)
            .iter()
            .filter(|message| matches!(message, OutcomeGenerationMessage::RoundStart { .. }))
            .count()
    }

    fn prepares(h: &Harness) -> usize {
        broadcasts(h)
            .iter()
            .filter(|message| matches!(message, OutcomeGenerationMessage::Prepare { .. }))
            .count()
    }

    fn observations_sent(h: &Harness) -> Vec<(OracleId, SeqNr)> {
        h.endpoint
            .sent()
            .into_iter()
            .filter_map(|(to, message)| match message {
                Message::OutcomeGeneration(OutcomeGenerationMessage::Observation {
                    seq_nr, ..
                }) => Some((to, seq_nr)),
                _ => None,
            })
            .collect()
    }

    /// Enter `epoch` led by `leader`, starting from `highest`
    async fn start_epoch(
        h: &mut Harness,
        epoch: Epoch,
        leader: u8,
        highest: CertifiedPrepareOrCommit,
    ) {
        h.og
            .handle_epoch_start(EpochStartEvent {
                epoch,
                leader: OracleId(leader),
            })
            .await
            .unwrap();
        deliver(
            h,
            leader,
            OutcomeGenerationMessage::EpochStart {
                epoch,
                epoch_start_proof: unanimous(epoch, highest),
            },
        )
        .await;
    }

    /// Run RoundStart and a proposal of observations from 0, 1 and 2.
    /// Returns the outcome and inputs digest the follower prepared.
    async fn propose(
        h: &mut Harness,
        epoch: Epoch,
        seq_nr: SeqNr,
        leader: u8,
    ) -> (Outcome, orca_core::Hash) {
        deliver(
            h,
            leader,
            OutcomeGenerationMessage::RoundStart {
                epoch,
                seq_nr,
                query: query(seq_nr),
            },
        )
        .await;
        let proposal = observations(epoch, seq_nr, &honest(&[0, 1, 2]));
        let attributed: Vec<_> = proposal
            .iter()
            .map(AttributedSignedObservation::attributed_observation)
            .collect();
        deliver(
            h,
            leader,
            OutcomeGenerationMessage::Proposal {
                epoch,
                seq_nr,
                attributed_signed_observations: proposal,
            },
        )
        .await;
        let outcome = format!("seq={} observations=3", seq_nr).into_bytes();
        let inputs = outcome_inputs_digest(ogid(epoch), seq_nr, &query(seq_nr), &attributed);
        (outcome, inputs)
    }

    async fn prepare_from(
        h: &mut Harness,
        epoch: Epoch,
        seq_nr: SeqNr,
        outcome: &[u8],
        inputs: &orca_core::Hash,
        signers: &[u8],
    ) {
        let digest = outcome_digest(outcome);
        for signer in signers {
            let signature =
                PrepareSignature::sign(ogid(epoch), seq_nr, inputs, &digest, &key(*signer));
            deliver(
                h,
                *signer,
                OutcomeGenerationMessage::Prepare {
                    epoch,
                    seq_nr,
                    signature,
                },
            )
            .await;
        }
    }

    async fn commit_from(
        h: &mut Harness,
        epoch: Epoch,
        seq_nr: SeqNr,
        outcome: &[u8],
        signers: &[u8],
    ) {
        let digest = outcome_digest(outcome);
        for signer in signers {
            let signature = CommitSignature::sign(ogid(epoch), seq_nr, &digest, &key(*signer));
            deliver(
                h,
                *signer,
                OutcomeGenerationMessage::Commit {
                    epoch,
                    seq_nr,
                    signature,
                },
            )
            .await;
        }
    }

    /// Drive one full round at `seq_nr` through commit
    async fn complete_round(h: &mut Harness, epoch: Epoch, seq_nr: SeqNr, leader: u8) -> Outcome {
        let (outcome, inputs) = propose(h, epoch, seq_nr, leader).await;
        prepare_from(h, epoch, seq_nr, &outcome, &inputs, &[1, 2, 3]).await;
        commit_from(h, epoch, seq_nr, &outcome, &[1, 2, 3]).await;
        outcome
    }

    /// Leader of `epoch` through its epoch start, with the first RoundStart out
    async fn lead_epoch(h: &mut Harness, epoch: Epoch) {
        let id = h.og.ctx.id;
        h.og
            .handle_epoch_start(EpochStartEvent { epoch, leader: id })
            .await
            .unwrap();
        let genesis = CertifiedPrepareOrCommit::genesis();
        for sender in 1..4u8 {
            deliver(
                h,
                sender,
                OutcomeGenerationMessage::EpochStartRequest {
                    epoch,
                    highest_certified: genesis.clone(),
                    signed_highest_certified_timestamp: SignedHighestCertifiedTimestamp::sign(
                        ogid(epoch),
                        genesis.timestamp(),
                        &key(sender),
                    ),
                },
            )
            .await;
        }
        let epoch_start = broadcasts(h)
            .into_iter()
            .find(|message| matches!(message, OutcomeGenerationMessage::EpochStart { .. }))
            .unwrap();
        deliver(h, id.0, epoch_start).await;
        assert_eq!(h.og.leader_state.phase, LeaderPhase::SentRoundStart);
    }

    #[tokio::test]
    async fn test_round_start_ignored_once_prepared() {
        let mut h = harness(0);
        start_epoch(&mut h, 1, 1, CertifiedPrepareOrCommit::genesis()).await;
        assert_eq!(h.og.follower.phase, FollowerPhase::NewRound);

        let (outcome, _) = propose(&mut h, 1, 1, 1).await;
        assert_eq!(observations_sent(&h), vec![(OracleId(1), 1)]);
        assert_eq!(h.og.follower.phase, FollowerPhase::SentPrepare);

        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::RoundStart {
                epoch: 1,
                seq_nr: 1,
                query: b"another query".to_vec(),
            },
        )
        .await;
        assert_eq!(observations_sent(&h).len(), 1);
        assert_eq!(h.og.follower.phase, FollowerPhase::SentPrepare);
        let prepared = h.og.follower.prepared.as_ref().unwrap();
        assert_eq!(prepared.outcome, outcome);
        assert_eq!(prepares(&h), 1);
    }

    #[tokio::test]
    async fn test_round_start_from_non_leader_is_ignored() {
        let mut h = harness(0);
        start_epoch(&mut h, 1, 1, CertifiedPrepareOrCommit::genesis()).await;
        deliver(
            &mut h,
            2,
            OutcomeGenerationMessage::RoundStart {
                epoch: 1,
                seq_nr: 1,
                query: query(1),
            },
        )
        .await;
        assert!(observations_sent(&h).is_empty());
        assert_eq!(h.og.follower.phase, FollowerPhase::NewRound);
    }

    #[tokio::test]
    async fn test_rejects_malformed_proposals() {
        let mut h = harness(0);
        start_epoch(&mut h, 1, 1, CertifiedPrepareOrCommit::genesis()).await;
        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::RoundStart {
                epoch: 1,
                seq_nr: 1,
                query: query(1),
            },
        )
        .await;

        let unsorted = observations(1, 1, &honest(&[1, 0, 2]));
        let repeated = observations(1, 1, &honest(&[0, 1, 1]));
        let forged = observations(1, 1, &[(0, 0), (1, 3), (2, 2)]);
        let short = observations(1, 1, &honest(&[0, 1]));
        for attributed_signed_observations in [unsorted, repeated, forged, short] {
            deliver(
                &mut h,
                1,
                OutcomeGenerationMessage::Proposal {
                    epoch: 1,
                    seq_nr: 1,
                    attributed_signed_observations,
                },
            )
            .await;
            assert_eq!(h.og.follower.phase, FollowerPhase::SentObservation);
            assert_eq!(prepares(&h), 0);
        }

        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::Proposal {
                epoch: 1,
                seq_nr: 1,
                attributed_signed_observations: observations(1, 1, &honest(&[0, 1, 2])),
            },
        )
        .await;
        assert_eq!(h.og.follower.phase, FollowerPhase::SentPrepare);
        assert_eq!(prepares(&h), 1);
    }

    #[tokio::test]
    async fn test_future_epoch_messages_replay_on_epoch_start() {
        let mut h = harness(0);
        h.og
            .handle_epoch_start(EpochStartEvent {
                epoch: 1,
                leader: OracleId(1),
            })
            .await
            .unwrap();

        deliver(
            &mut h,
            2,
            OutcomeGenerationMessage::EpochStart {
                epoch: 2,
                epoch_start_proof: unanimous(2, CertifiedPrepareOrCommit::genesis()),
            },
        )
        .await;
        deliver(
            &mut h,
            2,
            OutcomeGenerationMessage::RoundStart {
                epoch: 2,
                seq_nr: 1,
                query: query(1),
            },
        )
        .await;
        assert_eq!(h.og.future_messages.len(), 2);
        assert_eq!(h.og.follower.phase, FollowerPhase::NewEpoch);
        assert!(observations_sent(&h).is_empty());

        h.og
            .handle_epoch_start(EpochStartEvent {
                epoch: 2,
                leader: OracleId(2),
            })
            .await
            .unwrap();
        assert_eq!(h.og.future_messages.len(), 0);
        assert_eq!(h.og.follower.phase, FollowerPhase::SentObservation);
        assert_eq!(observations_sent(&h), vec![(OracleId(2), 1)]);

        // the old epoch's messages are now stale
        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::RoundStart {
                epoch: 1,
                seq_nr: 1,
                query: query(1),
            },
        )
        .await;
        assert_eq!(observations_sent(&h).len(), 1);
        assert_eq!(h.og.future_messages.len(), 0);
    }

    #[tokio::test]
    async fn test_commit_replay_is_delivered_once() {
        let mut h = harness(0);
        start_epoch(&mut h, 1, 1, CertifiedPrepareOrCommit::genesis()).await;
        let outcome = complete_round(&mut h, 1, 1, 1).await;

        let delivered = h.committed.try_recv().unwrap();
        assert_eq!(delivered.certified_commit.seq_nr, 1);
        assert_eq!(delivered.certified_commit.outcome, outcome);
        assert_eq!(h.og.follower.seq_nr, 2);

        // repeated and late commit signatures for the delivered round
        commit_from(&mut h, 1, 1, &outcome, &[1, 2, 3, 0]).await;
        assert!(h.committed.try_recv().is_err());

        // a new epoch starting from the same commit
        start_epoch(
            &mut h,
            2,
            2,
            CertifiedPrepareOrCommit::Commit(certified_commit(1, 1, &outcome)),
        )
        .await;
        assert_eq!(h.og.follower.seq_nr, 2);
        assert!(h.committed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_epoch_start_proof_below_reported_timestamp() {
        let mut h = harness(0);
        h.og
            .handle_epoch_start(EpochStartEvent {
                epoch: 2,
                leader: OracleId(1),
            })
            .await
            .unwrap();

        let committed_4 = CertifiedPrepareOrCommit::Commit(certified_commit(4, 1, b"four"));
        let prepared_5 = CertifiedPrepareOrCommit::Prepare(certified_prepare(5, 1, b"five"));
        let understated = epoch_start_proof(
            2,
            committed_4.clone(),
            &[
                (1, committed_4.timestamp()),
                (2, committed_4.timestamp()),
                (3, prepared_5.timestamp()),
            ],
        );
        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::EpochStart {
                epoch: 2,
                epoch_start_proof: understated,
            },
        )
        .await;
        assert_eq!(h.og.follower.phase, FollowerPhase::NewEpoch);
        assert_eq!(h.og.delivered_seq_nr, 0);

        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::EpochStart {
                epoch: 2,
                epoch_start_proof: unanimous(2, committed_4),
            },
        )
        .await;
        assert_eq!(h.og.follower.phase, FollowerPhase::NewRound);
        assert_eq!(h.og.follower.seq_nr, 5);
        assert_eq!(h.committed.try_recv().unwrap().certified_commit.seq_nr, 4);
    }

    #[tokio::test]
    async fn test_later_epoch_prepare_replaces_durable_prepare() {
        let mut h = harness(0);
        let stale = CertifiedPrepareOrCommit::Prepare(certified_prepare(5, 1, b"A"));
        h.database.write_cert(CD, &stale).unwrap();
        h.og.restore(stale);

        start_epoch(
            &mut h,
            2,
            1,
            CertifiedPrepareOrCommit::Commit(certified_commit(4, 1, b"four")),
        )
        .await;
        assert_eq!(h.og.follower.seq_nr, 5);

        let (outcome, inputs) = propose(&mut h, 2, 5, 1).await;
        assert_ne!(outcome, b"A".to_vec());
        prepare_from(&mut h, 2, 5, &outcome, &inputs, &[1, 2, 3]).await;

        assert!(broadcasts(&h).iter().any(|message| matches!(
            message,
            OutcomeGenerationMessage::Commit { epoch: 2, seq_nr: 5, .. }
        )));
        match h.database.read_cert(CD).unwrap().unwrap() {
            CertifiedPrepareOrCommit::Prepare(cp) => {
                assert_eq!(cp.prepare_epoch, 2);
                assert_eq!(cp.outcome, outcome);
            }
            other => panic!("expected a certified prepare, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leader_prefers_later_epoch_prepare() {
        let mut h = harness(0);
        h.og
            .handle_epoch_start(EpochStartEvent {
                epoch: 3,
                leader: OracleId(0),
            })
            .await
            .unwrap();

        let requests = [
            (1u8, CertifiedPrepareOrCommit::Prepare(certified_prepare(5, 1, b"A"))),
            (2, CertifiedPrepareOrCommit::Prepare(certified_prepare(5, 2, b"B"))),
            (3, CertifiedPrepareOrCommit::Commit(certified_commit(4, 1, b"four"))),
        ];
        for (sender, highest_certified) in requests {
            let signed = SignedHighestCertifiedTimestamp::sign(
                ogid(3),
                highest_certified.timestamp(),
                &key(sender),
            );
            deliver(
                &mut h,
                sender,
                OutcomeGenerationMessage::EpochStartRequest {
                    epoch: 3,
                    highest_certified,
                    signed_highest_certified_timestamp: signed,
                },
            )
            .await;
        }

        let proof = broadcasts(&h)
            .into_iter()
            .find_map(|message| match message {
                OutcomeGenerationMessage::EpochStart {
                    epoch_start_proof, ..
                } => Some(epoch_start_proof),
                _ => None,
            })
            .unwrap();
        assert_eq!(proof.highest_certified.outcome(), &b"B".to_vec());
        proof.verify(ogid(3), &h.og.keys, 3).unwrap();
    }

    #[tokio::test]
    async fn test_leader_retries_only_while_collecting() {
        let mut h = harness(0);
        lead_epoch(&mut h, 1).await;
        assert_eq!(round_starts(&h), 1);

        h.og.on_round_timer().await.unwrap();
        assert_eq!(round_starts(&h), 2);
        assert_eq!(h.og.leader_state.phase, LeaderPhase::SentRoundStart);

        for observation in observations(1, 1, &honest(&[0, 1, 2])) {
            deliver(
                &mut h,
                observation.observer.0,
                OutcomeGenerationMessage::Observation {
                    epoch: 1,
                    seq_nr: 1,
                    signed_observation: observation.signed_observation,
                },
            )
            .await;
        }
        assert_eq!(h.og.leader_state.phase, LeaderPhase::Grace);
        h.og.on_grace_timer();
        assert_eq!(h.og.leader_state.phase, LeaderPhase::SentProposal);

        h.og.on_round_timer().await.unwrap();
        assert_eq!(round_starts(&h), 2);
        assert_eq!(h.og.leader_state.phase, LeaderPhase::SentProposal);
        assert!(h.pacemaker_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_leader_out_of_rounds_changes_leader() {
        let mut h = harness_with(
            0,
            SharedConfig {
                r_max: 1,
                ..shared_config(4, 1)
            },
        );
        lead_epoch(&mut h, 1).await;

        h.og.on_round_timer().await.unwrap();
        assert_eq!(round_starts(&h), 1);
        assert_eq!(
            h.pacemaker_events.try_recv().unwrap(),
            PacemakerEvent::ChangeLeader { epoch: 1 }
        );
    }

    #[tokio::test]
    async fn test_follower_changes_leader_after_r_max_commits() {
        let mut h = harness_with(
            0,
            SharedConfig {
                r_max: 1,
                ..shared_config(4, 1)
            },
        );
        start_epoch(&mut h, 1, 1, CertifiedPrepareOrCommit::genesis()).await;
        complete_round(&mut h, 1, 1, 1).await;

        assert_eq!(
            h.pacemaker_events.try_recv().unwrap(),
            PacemakerEvent::Progress { epoch: 1 }
        );
        assert_eq!(
            h.pacemaker_events.try_recv().unwrap(),
            PacemakerEvent::ChangeLeader { epoch: 1 }
        );

        // past r_max a round start asks again, but the request is sent once
        deliver(
            &mut h,
            1,
            OutcomeGenerationMessage::RoundStart {
                epoch: 1,
                seq_nr: 2,
                query: query(2),
            },
        )
        .await;
        assert!(h.pacemaker_events.try_recv().is_err());
        assert_eq!(observations_sent(&h).len(), 1);
    }
}
