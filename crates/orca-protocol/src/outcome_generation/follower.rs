use std::collections::BTreeMap;

use orca_core::{AttributedObservation, Hash, OracleId, Outcome, Query, SeqNr};
use tracing::{debug, info, warn};

use super::{OutcomeGeneration, POOL_WINDOW};
use crate::error::ProtocolError;
use crate::events::PacemakerEvent;
use crate::messages::OutcomeGenerationMessage;
use crate::plugin::{call_plugin, ReportingPlugin};
use crate::pool::{Pool, PoolEntry, PutResult};
use crate::qc::{CertifiedCommit, CertifiedPrepare, CertifiedPrepareOrCommit, EpochStartProof};
use crate::signed_data::{
    outcome_digest, outcome_inputs_digest, AttributedCommitSignature, AttributedPrepareSignature,
    AttributedSignedObservation, CommitSignature, PrepareSignature, SignedObservation,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FollowerPhase {
    NewEpoch,
    NewRound,
    SentObservation,
    SentPrepare,
    SentCommit,
}

/// The outcome this oracle signed a prepare for
#[derive(Debug, Clone)]
pub(super) struct Prepared {
    pub inputs_digest: Hash,
    pub outcome_digest: Hash,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub(super) struct FollowerState {
    pub phase: FollowerPhase,
    pub first_seq_nr: SeqNr,
    /// Sequence number of the round in progress
    pub seq_nr: SeqNr,
    /// Re-certifying a prepared outcome carried over from an earlier epoch
    pub reproposal: bool,
    pub query: Option<Query>,
    pub prepared: Option<Prepared>,
    pub prepares: Pool<PrepareSignature>,
    pub commits: Pool<CommitSignature>,
}

impl FollowerState {
    pub fn new(delivered_seq_nr: SeqNr) -> Self {
        FollowerState {
            phase: FollowerPhase::NewEpoch,
            first_seq_nr: delivered_seq_nr + 1,
            seq_nr: delivered_seq_nr + 1,
            reproposal: false,
            query: None,
            prepared: None,
            prepares: Pool::new(POOL_WINDOW),
            commits: Pool::new(POOL_WINDOW),
        }
    }

    fn begin_round(&mut self, seq_nr: SeqNr) {
        self.seq_nr = seq_nr;
        self.phase = FollowerPhase::NewRound;
        self.reproposal = false;
        self.query = None;
        self.prepared = None;
    }
}

/// Verify the not yet checked entries of one round and return the first
/// `quorum` valid ones in signer order, if there are that many
fn certify<T: Copy>(
    round: Option<&mut BTreeMap<OracleId, PoolEntry<T>>>,
    quorum: usize,
    check: impl Fn(OracleId, &T) -> bool,
) -> Option<Vec<(OracleId, T)>> {
    let round = round?;
    for (signer, entry) in round.iter_mut() {
        if entry.verified.is_none() {
            let valid = check(*signer, &entry.item);
            if !valid {
                debug!("Invalid signature from {} in pool", signer);
            }
            entry.verified = Some(valid);
        }
    }
    let valid: Vec<_> = round
        .iter()
        .filter(|(_, entry)| entry.verified == Some(true))
        .map(|(signer, entry)| (*signer, entry.item))
        .take(quorum)
        .collect();
    (valid.len() >= quorum).then_some(valid)
}

impl<P: ReportingPlugin> OutcomeGeneration<P> {
    pub(super) async fn on_epoch_start(
        &mut self,
        sender: OracleId,
        proof: EpochStartProof,
    ) -> Result<(), ProtocolError> {
        if sender != self.leader {
            debug!("Dropping epoch start from non-leader {}", sender);
            return Ok(());
        }
        if self.follower.phase != FollowerPhase::NewEpoch {
            return Ok(());
        }
        let quorum = self.ctx.config.byz_quorum_size();
        if let Err(e) = proof.verify(self.ogid(), &self.keys, quorum) {
            debug!("Dropping invalid epoch start proof from {}: {}", sender, e);
            return Ok(());
        }

        match proof.highest_certified {
            CertifiedPrepareOrCommit::Commit(cc) => {
                let next = cc.seq_nr + 1;
                if !self.commit(cc).await? {
                    return Ok(());
                }
                self.follower.first_seq_nr = next;
                self.follower.begin_round(next);
                debug!(
                    "Oracle {} starts epoch {} at seq {}",
                    self.ctx.id, self.epoch, next
                );
                self.start_round().await?;
            }
            CertifiedPrepareOrCommit::Prepare(cp) => {
                info!(
                    "Oracle {} re-proposing prepared seq {} in epoch {}",
                    self.ctx.id, cp.seq_nr, self.epoch
                );
                self.follower.first_seq_nr = cp.seq_nr;
                self.follower.begin_round(cp.seq_nr);
                self.follower.reproposal = true;
                self.sign_prepare(cp.seq_nr, cp.outcome_inputs_digest, cp.outcome);
                self.try_certify_prepare(cp.seq_nr).await?;
            }
        }
        Ok(())
    }

    pub(super) async fn on_round_start(
        &mut self,
        sender: OracleId,
        seq_nr: SeqNr,
        query: Query,
    ) -> Result<(), ProtocolError> {
        if sender != self.leader {
            debug!("Dropping round start from non-leader {}", sender);
            return Ok(());
        }
        let follower = &self.follower;
        let fresh = matches!(
            follower.phase,
            FollowerPhase::NewRound | FollowerPhase::SentObservation
        );
        if seq_nr != follower.seq_nr || !fresh || follower.reproposal {
            debug!(
                "Oracle {} ignoring round start for seq {} in phase {:?} at seq {}",
                self.ctx.id, seq_nr, follower.phase, follower.seq_nr
            );
            return Ok(());
        }

        let ctx = self.outcome_context(seq_nr);
        if ctx.round > self.ctx.config.r_max {
            return self
                .notify_pacemaker(PacemakerEvent::ChangeLeader { epoch: self.epoch })
                .await;
        }

        self.follower.phase = FollowerPhase::NewRound;
        self.follower.query = Some(query.clone());
        let observation = call_plugin(
            "observation",
            self.ctx.local.max_duration_observation(),
            self.plugin.observation(&ctx, &query),
        )
        .await;
        let Some(observation) = observation else {
            return Ok(());
        };
        if observation.len() > self.ctx.config.max_observation_length {
            warn!(
                "Plugin produced an observation of {} bytes, limit is {}",
                observation.len(),
                self.ctx.config.max_observation_length
            );
            return Ok(());
        }

        let signed_observation = SignedObservation::sign(
            self.ogid(),
            seq_nr,
            &query,
            observation,
            self.keyring.as_ref(),
        );
        self.send_to(
            self.leader,
            OutcomeGenerationMessage::Observation {
                epoch: self.epoch,
                seq_nr,
                signed_observation,
            },
        );
        self.follower.phase = FollowerPhase::SentObservation;
        Ok(())
    }

    pub(super) async fn on_proposal(
        &mut self,
        sender: OracleId,
        seq_nr: SeqNr,
        observations: Vec<AttributedSignedObservation>,
    ) -> Result<(), ProtocolError> {
        if sender != self.leader {
            debug!("Dropping proposal from non-leader {}", sender);
            return Ok(());
        }
        let fresh = matches!(
            self.follower.phase,
            FollowerPhase::NewRound | FollowerPhase::SentObservation
        );
        if seq_nr != self.follower.seq_nr || !fresh {
            return Ok(());
        }
        let Some(query) = self.follower.query.clone() else {
            debug!("Dropping proposal for seq {} without round start", seq_nr);
            return Ok(());
        };

        let Some(observations) = self.check_proposal(seq_nr, &query, &observations).await else {
            return Ok(());
        };

        let ctx = self.outcome_context(seq_nr);
        let outcome = call_plugin(
            "outcome",
            self.ctx.local.max_duration_outcome(),
            self.plugin.outcome(&ctx, &query, &observations),
        )
        .await;
        let Some(outcome) = outcome else {
            return Ok(());
        };
        if outcome.len() > self.ctx.config.max_outcome_length {
            warn!(
                "Plugin produced an outcome of {} bytes, limit is {}",
                outcome.len(),
                self.ctx.config.max_outcome_length
            );
            return Ok(());
        }

        let inputs_digest = outcome_inputs_digest(self.ogid(), seq_nr, &query, &observations);
        self.sign_prepare(seq_nr, inputs_digest, outcome);
        self.try_certify_prepare(seq_nr).await
    }

    /// Check every observation of a proposal. `None` rejects the proposal.
    async fn check_proposal(
        &self,
        seq_nr: SeqNr,
        query: &Query,
        observations: &[AttributedSignedObservation],
    ) -> Option<Vec<AttributedObservation>> {
        let config = &self.ctx.config;
        let ctx = self.outcome_context(seq_nr);
        let quorum = self.plugin.observation_quorum(&ctx, query);
        if !quorum.is_valid(config.n(), config.f) {
            warn!("Plugin requested unattainable observation quorum {:?}", quorum);
            return None;
        }
        if observations.len() < quorum.size(config.n(), config.f) {
            debug!(
                "Dropping proposal with {} observations, quorum is {:?}",
                observations.len(),
                quorum
            );
            return None;
        }
        if observations
            .windows(2)
            .any(|pair| pair[0].observer >= pair[1].observer)
        {
            debug!("Dropping proposal with unsorted or repeated observers");
            return None;
        }

        let ogid = self.ogid();
        let mut attributed = Vec::with_capacity(observations.len());
        for aso in observations {
            let Some(key) = self.keys.get(aso.observer.index()) else {
                debug!("Dropping proposal naming unknown observer {}", aso.observer);
                return None;
            };
            if let Err(e) = aso.signed_observation.verify(ogid, seq_nr, query, key) {
                debug!("Dropping proposal, observation of {}: {}", aso.observer, e);
                return None;
            }
            let observation = aso.attributed_observation();
            call_plugin(
                "validate_observation",
                self.ctx.local.max_duration_validate_observation(),
                self.plugin.validate_observation(&ctx, query, &observation),
            )
            .await?;
            attributed.push(observation);
        }
        Some(attributed)
    }

    fn sign_prepare(&mut self, seq_nr: SeqNr, inputs_digest: Hash, outcome: Outcome) {
        let digest = outcome_digest(&outcome);
        let signature = PrepareSignature::sign(
            self.ogid(),
            seq_nr,
            &inputs_digest,
            &digest,
            self.keyring.as_ref(),
        );
        self.follower.prepared = Some(Prepared {
            inputs_digest,
            outcome_digest: digest,
            outcome,
        });
        self.follower.phase = FollowerPhase::SentPrepare;
        self.broadcast(OutcomeGenerationMessage::Prepare {
            epoch: self.epoch,
            seq_nr,
            signature,
        });
    }

    pub(super) async fn on_prepare(
        &mut self,
        sender: OracleId,
        seq_nr: SeqNr,
        signature: PrepareSignature,
    ) -> Result<(), ProtocolError> {
        self.public_key(sender)?;
        match self
            .follower
            .prepares
            .put(self.delivered_seq_nr, seq_nr, sender, signature)
        {
            PutResult::Inserted => self.try_certify_prepare(seq_nr).await,
            PutResult::Duplicate => Ok(()),
            PutResult::OutOfWindow => {
                debug!("Dropping prepare for seq {} from {}", seq_nr, sender);
                Ok(())
            }
        }
    }

    pub(super) async fn on_commit(
        &mut self,
        sender: OracleId,
        seq_nr: SeqNr,
        signature: CommitSignature,
    ) -> Result<(), ProtocolError> {
        self.public_key(sender)?;
        match self
            .follower
            .commits
            .put(self.delivered_seq_nr, seq_nr, sender, signature)
        {
            PutResult::Inserted => self.try_certify_commit(seq_nr).await,
            PutResult::Duplicate => Ok(()),
            PutResult::OutOfWindow => {
                debug!("Dropping commit for seq {} from {}", seq_nr, sender);
                Ok(())
            }
        }
    }

    async fn try_certify_prepare(&mut self, seq_nr: SeqNr) -> Result<(), ProtocolError> {
        if self.follower.phase != FollowerPhase::SentPrepare || self.follower.seq_nr != seq_nr {
            return Ok(());
        }
        let Some(prepared) = self.follower.prepared.clone() else {
            return Ok(());
        };

        let ogid = self.ogid();
        let keys = &self.keys;
        let signatures = certify(
            self.follower.prepares.round_mut(seq_nr),
            self.ctx.config.byz_quorum_size(),
            |signer, signature: &PrepareSignature| {
                signature
                    .verify(
                        ogid,
                        seq_nr,
                        &prepared.inputs_digest,
                        &prepared.outcome_digest,
                        &keys[signer.index()],
                    )
                    .is_ok()
            },
        );
        let Some(signatures) = signatures else {
            return Ok(());
        };

        let certified_prepare = CertifiedPrepare {
            prepare_epoch: self.epoch,
            seq_nr,
            outcome_inputs_digest: prepared.inputs_digest,
            outcome: prepared.outcome,
            prepare_quorum_certificate: signatures
                .into_iter()
                .map(|(signer, signature)| AttributedPrepareSignature { signature, signer })
                .collect(),
        };
        if !self
            .persist(CertifiedPrepareOrCommit::Prepare(certified_prepare))
            .await
        {
            return Ok(());
        }

        let signature = CommitSignature::sign(
            ogid,
            seq_nr,
            &prepared.outcome_digest,
            self.keyring.as_ref(),
        );
        self.follower.phase = FollowerPhase::SentCommit;
        self.broadcast(OutcomeGenerationMessage::Commit {
            epoch: self.epoch,
            seq_nr,
            signature,
        });
        self.try_certify_commit(seq_nr).await
    }

    async fn try_certify_commit(&mut self, seq_nr: SeqNr) -> Result<(), ProtocolError> {
        let certifying = matches!(
            self.follower.phase,
            FollowerPhase::SentPrepare | FollowerPhase::SentCommit
        );
        if !certifying || self.follower.seq_nr != seq_nr {
            return Ok(());
        }
        let Some(prepared) = self.follower.prepared.clone() else {
            return Ok(());
        };

        let ogid = self.ogid();
        let keys = &self.keys;
        let signatures = certify(
            self.follower.commits.round_mut(seq_nr),
            self.ctx.config.byz_quorum_size(),
            |signer, signature: &CommitSignature| {
                signature
                    .verify(ogid, seq_nr, &prepared.outcome_digest, &keys[signer.index()])
                    .is_ok()
            },
        );
        let Some(signatures) = signatures else {
            return Ok(());
        };

        let certified_commit = CertifiedCommit {
            commit_epoch: self.epoch,
            seq_nr,
            outcome: prepared.outcome,
            commit_quorum_certificate: signatures
                .into_iter()
                .map(|(signer, signature)| AttributedCommitSignature { signature, signer })
                .collect(),
        };
        if !self.commit(certified_commit).await? {
            return Ok(());
        }

        let round = seq_nr - self.follower.first_seq_nr + 1;
        self.follower.begin_round(seq_nr + 1);
        self.follower.prepares.reap_below(seq_nr + 1);
        self.follower.commits.reap_below(seq_nr + 1);

        self.notify_pacemaker(PacemakerEvent::Progress { epoch: self.epoch })
            .await?;
        if round >= self.ctx.config.r_max {
            info!(
                "Oracle {} reached {} rounds in epoch {}",
                self.ctx.id, round, self.epoch
            );
            self.notify_pacemaker(PacemakerEvent::ChangeLeader { epoch: self.epoch })
                .await?;
        }
        self.schedule_next_round();
        Ok(())
    }
}
