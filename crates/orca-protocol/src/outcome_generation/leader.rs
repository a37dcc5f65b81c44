use std::collections::BTreeMap;

use orca_core::{AttributedObservation, OracleId, Query, SeqNr};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::follower::FollowerPhase;
use super::OutcomeGeneration;
use crate::error::ProtocolError;
use crate::events::PacemakerEvent;
use crate::messages::OutcomeGenerationMessage;
use crate::plugin::{call_plugin, ReportingPlugin};
use crate::qc::{CertifiedPrepareOrCommit, EpochStartProof};
use crate::signed_data::{
    AttributedSignedHighestCertifiedTimestamp, AttributedSignedObservation,
    SignedHighestCertifiedTimestamp, SignedObservation,
};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(super) enum LeaderPhase {
    #[default]
    NewEpoch,
    SentEpochStart,
    SentRoundStart,
    Grace,
    SentProposal,
}

#[derive(Debug, Default)]
pub(super) struct LeaderState {
    pub phase: LeaderPhase,
    /// First valid epoch start request of each oracle
    requests: BTreeMap<OracleId, (CertifiedPrepareOrCommit, SignedHighestCertifiedTimestamp)>,
    seq_nr: SeqNr,
    query: Query,
    observations: BTreeMap<OracleId, SignedObservation>,
    /// RoundStarts sent this epoch, retries included
    round_attempts: u64,
    last_round_start: Option<Instant>,
    pub round_timer: Timer,
    pub grace_timer: Timer,
}

impl LeaderState {
    pub fn reset(&mut self) {
        *self = LeaderState::default();
    }
}

impl<P: ReportingPlugin> OutcomeGeneration<P> {
    pub(super) fn on_epoch_start_request(
        &mut self,
        sender: OracleId,
        highest_certified: CertifiedPrepareOrCommit,
        signed_timestamp: SignedHighestCertifiedTimestamp,
    ) -> Result<(), ProtocolError> {
        if !self.is_leader() || self.leader_state.phase != LeaderPhase::NewEpoch {
            return Ok(());
        }
        if self.leader_state.requests.contains_key(&sender) {
            return Ok(());
        }

        let key = self.public_key(sender)?;
        if let Err(e) = signed_timestamp.verify(self.ogid(), key) {
            debug!("Dropping epoch start request from {}: {}", sender, e);
            return Ok(());
        }
        if signed_timestamp.timestamp != highest_certified.timestamp() {
            debug!(
                "Dropping epoch start request from {}: timestamp does not match certificate",
                sender
            );
            return Ok(());
        }
        let quorum = self.ctx.config.byz_quorum_size();
        if let Err(e) = highest_certified.verify(self.ctx.config.config_digest, &self.keys, quorum)
        {
            debug!("Dropping epoch start request from {}: {}", sender, e);
            return Ok(());
        }

        self.leader_state
            .requests
            .insert(sender, (highest_certified, signed_timestamp));
        if self.leader_state.requests.len() < quorum {
            return Ok(());
        }

        let highest_certified = self
            .leader_state
            .requests
            .values()
            .map(|(cert, _)| cert)
            .max_by_key(|cert| cert.timestamp())
            .cloned()
            .ok_or_else(|| ProtocolError::Invariant("no epoch start requests".into()))?;
        let highest_certified_proof = self
            .leader_state
            .requests
            .iter()
            .map(|(signer, (_, signed_timestamp))| AttributedSignedHighestCertifiedTimestamp {
                signed_timestamp: *signed_timestamp,
                signer: *signer,
            })
            .collect();

        info!(
            "Leader {} starting epoch {} from {:?}",
            self.ctx.id,
            self.epoch,
            highest_certified.timestamp()
        );
        self.leader_state.phase = LeaderPhase::SentEpochStart;
        self.broadcast(OutcomeGenerationMessage::EpochStart {
            epoch: self.epoch,
            epoch_start_proof: EpochStartProof {
                highest_certified,
                highest_certified_proof,
            },
        });
        Ok(())
    }

    /// Start the next round, or retry the current one while it is still
    /// collecting observations. A proposed round is left to commit or to
    /// the pacemaker's progress timeout.
    pub(super) async fn on_round_timer(&mut self) -> Result<(), ProtocolError> {
        let state = &self.leader_state;
        let current = state.last_round_start.is_some() && state.seq_nr == self.follower.seq_nr;
        let collecting = matches!(state.phase, LeaderPhase::SentRoundStart | LeaderPhase::Grace);
        if current && !collecting {
            debug!(
                "Leader {} not retrying seq {} in phase {:?}",
                self.ctx.id, state.seq_nr, state.phase
            );
            return Ok(());
        }
        self.start_round().await
    }

    /// Start the next round if this oracle leads the epoch and the epoch is
    /// past its start.
    pub(super) async fn start_round(&mut self) -> Result<(), ProtocolError> {
        if !self.is_leader() || self.leader_state.phase == LeaderPhase::NewEpoch {
            return Ok(());
        }
        if self.follower.phase == FollowerPhase::NewEpoch || self.follower.reproposal {
            return Ok(());
        }

        let seq_nr = self.follower.seq_nr;
        let ctx = self.outcome_context(seq_nr);
        self.leader_state.round_attempts += 1;
        if ctx.round > self.ctx.config.r_max
            || self.leader_state.round_attempts > self.ctx.config.r_max
        {
            debug!(
                "Leader {} out of rounds in epoch {}",
                self.ctx.id, self.epoch
            );
            return self
                .notify_pacemaker(PacemakerEvent::ChangeLeader { epoch: self.epoch })
                .await;
        }

        // the same timer retries the round if it has not committed by then
        self.leader_state.last_round_start = Some(Instant::now());
        self.leader_state.round_timer.arm(self.ctx.config.delta_round());
        let query = call_plugin(
            "query",
            self.ctx.local.max_duration_query(),
            self.plugin.query(&ctx),
        )
        .await;
        let query = query.filter(|query| {
            let fits = query.len() <= self.ctx.config.max_query_length;
            if !fits {
                warn!(
                    "Plugin produced a query of {} bytes, limit is {}",
                    query.len(),
                    self.ctx.config.max_query_length
                );
            }
            fits
        });
        let Some(query) = query else {
            return Ok(());
        };

        debug!(
            "Leader {} starting round {} at seq {} in epoch {}",
            self.ctx.id, ctx.round, seq_nr, self.epoch
        );
        let state = &mut self.leader_state;
        state.seq_nr = seq_nr;
        state.query = query.clone();
        state.observations.clear();
        state.grace_timer.cancel();
        state.phase = LeaderPhase::SentRoundStart;
        self.broadcast(OutcomeGenerationMessage::RoundStart {
            epoch: self.epoch,
            seq_nr,
            query,
        });
        Ok(())
    }

    /// Pace the round after a commit to one per `delta_round`
    pub(super) fn schedule_next_round(&mut self) {
        if !self.is_leader() {
            return;
        }
        let now = Instant::now();
        let next = self
            .leader_state
            .last_round_start
            .map_or(now, |start| (start + self.ctx.config.delta_round()).max(now));
        self.leader_state.grace_timer.cancel();
        self.leader_state.round_timer.arm_at(next);
    }

    pub(super) async fn on_observation(
        &mut self,
        sender: OracleId,
        seq_nr: SeqNr,
        signed_observation: SignedObservation,
    ) -> Result<(), ProtocolError> {
        let collecting = matches!(
            self.leader_state.phase,
            LeaderPhase::SentRoundStart | LeaderPhase::Grace
        );
        if !self.is_leader() || !collecting || seq_nr != self.leader_state.seq_nr {
            return Ok(());
        }
        if self.leader_state.observations.contains_key(&sender) {
            return Ok(());
        }

        let query = self.leader_state.query.clone();
        let key = self.public_key(sender)?;
        if let Err(e) = signed_observation.verify(self.ogid(), seq_nr, &query, key) {
            debug!("Dropping observation from {}: {}", sender, e);
            return Ok(());
        }

        let ctx = self.outcome_context(seq_nr);
        let attributed = AttributedObservation {
            observation: signed_observation.observation.clone(),
            observer: sender,
        };
        let valid = call_plugin(
            "validate_observation",
            self.ctx.local.max_duration_validate_observation(),
            self.plugin.validate_observation(&ctx, &query, &attributed),
        )
        .await;
        if valid.is_none() {
            return Ok(());
        }

        self.leader_state
            .observations
            .insert(sender, signed_observation);

        let config = &self.ctx.config;
        let quorum = self.plugin.observation_quorum(&ctx, &query);
        if !quorum.is_valid(config.n(), config.f) {
            warn!("Plugin requested unattainable observation quorum {:?}", quorum);
            return Ok(());
        }
        if self.leader_state.phase == LeaderPhase::SentRoundStart
            && self.leader_state.observations.len() >= quorum.size(config.n(), config.f)
        {
            self.leader_state.phase = LeaderPhase::Grace;
            self.leader_state.grace_timer.arm(config.delta_grace());
        }
        Ok(())
    }

    pub(super) fn on_grace_timer(&mut self) {
        if !self.is_leader() || self.leader_state.phase != LeaderPhase::Grace {
            return;
        }
        let attributed_signed_observations: Vec<_> = self
            .leader_state
            .observations
            .iter()
            .map(|(observer, signed_observation)| AttributedSignedObservation {
                signed_observation: signed_observation.clone(),
                observer: *observer,
            })
            .collect();
        debug!(
            "Leader {} proposing {} observations for seq {}",
            self.ctx.id,
            attributed_signed_observations.len(),
            self.leader_state.seq_nr
        );
        self.leader_state.phase = LeaderPhase::SentProposal;
        self.broadcast(OutcomeGenerationMessage::Proposal {
            epoch: self.epoch,
            seq_nr: self.leader_state.seq_nr,
            attributed_signed_observations,
        });
    }
}
