//! Epoch and leader lifecycle.
//!
//! Every oracle broadcasts the highest epoch it wishes to move to. Once more
//! than F oracles wish for an epoch beyond ours we join the wish, and once
//! more than 2F do we switch to it. The progress timer turns a silent epoch
//! into a wish for the next one.

use orca_core::{Epoch, OracleId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::{self, PacemakerState};
use crate::error::ProtocolError;
use crate::events::{EpochStartEvent, PacemakerEvent};
use crate::messages::PacemakerMessage;
use crate::oracle::OracleContext;
use crate::schedule::leader;
use crate::timer::Timer;

pub struct Pacemaker {
    ctx: OracleContext,
    inbox: mpsc::Receiver<(OracleId, PacemakerMessage)>,
    events: mpsc::Receiver<PacemakerEvent>,
    to_outcome_generation: mpsc::Sender<EpochStartEvent>,

    /// Current epoch; always persisted
    epoch: Epoch,
    leader: OracleId,
    /// Highest epoch we broadcast a wish for; always persisted
    ne: Epoch,
    /// Epoch the progress timer asked for, not yet persisted
    requested: Epoch,
    /// Highest wish heard from each oracle
    wishes: Vec<Epoch>,

    resend: Timer,
    progress: Timer,
}

impl Pacemaker {
    pub(crate) fn new(
        ctx: OracleContext,
        inbox: mpsc::Receiver<(OracleId, PacemakerMessage)>,
        events: mpsc::Receiver<PacemakerEvent>,
        to_outcome_generation: mpsc::Sender<EpochStartEvent>,
    ) -> Self {
        let n = ctx.config.n();
        Pacemaker {
            ctx,
            inbox,
            events,
            to_outcome_generation,
            epoch: 0,
            leader: OracleId(0),
            ne: 0,
            requested: 0,
            wishes: vec![0; n],
            resend: Timer::new(),
            progress: Timer::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let cd = self.ctx.config.config_digest;
        let restored = db::restore(
            &self.ctx.database,
            self.ctx.local.database_timeout(),
            self.ctx.local.persist_retry_backoff(),
            &self.ctx.cancel,
            "pacemaker state",
            move |db| db.read_state(cd),
        )
        .await
        .map_err(ProtocolError::Restore)?;
        let Some(restored) = restored else {
            return Ok(());
        };

        let state = restored.unwrap_or(PacemakerState {
            epoch: 1,
            highest_sent_new_epoch_wish: 1,
        });
        if !self.start(state).await? {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                Some((sender, message)) = self.inbox.recv() => {
                    self.handle_message(sender, message).await?;
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await?;
                }
                _ = self.resend.expired() => self.on_resend().await?,
                _ = self.progress.expired() => self.on_progress_timeout().await?,
            }
        }

        debug!("Pacemaker of {} stopped in epoch {}", self.ctx.id, self.epoch);
        Ok(())
    }

    /// Enter the restored epoch. Returns false if cancelled first.
    async fn start(&mut self, state: PacemakerState) -> Result<bool, ProtocolError> {
        let mut delay = self.ctx.local.persist_retry_backoff();
        while !self.persist(state).await {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.ctx.local.persist_retry_backoff() * 32);
        }

        self.ne = state.highest_sent_new_epoch_wish.max(state.epoch);
        self.requested = self.ne;
        self.broadcast_wish();
        self.enter_epoch(state.epoch).await?;
        Ok(true)
    }

    pub(crate) async fn handle_message(
        &mut self,
        sender: OracleId,
        message: PacemakerMessage,
    ) -> Result<(), ProtocolError> {
        let PacemakerMessage::NewEpochWish { epoch } = message;
        let wish = self.wishes.get_mut(sender.index()).ok_or_else(|| {
            ProtocolError::Invariant(format!("wish from out-of-range sender {}", sender))
        })?;
        if epoch <= *wish {
            return Ok(());
        }
        *wish = epoch;
        self.advance().await
    }

    pub(crate) async fn handle_event(&mut self, event: PacemakerEvent) -> Result<(), ProtocolError> {
        match event {
            PacemakerEvent::Progress { epoch } if epoch == self.epoch => {
                self.progress.arm(self.ctx.config.delta_progress());
                Ok(())
            }
            PacemakerEvent::ChangeLeader { epoch } if epoch == self.epoch => {
                info!("Oracle {} asked to leave epoch {}", self.ctx.id, epoch);
                self.request_next_epoch().await
            }
            _ => Ok(()),
        }
    }

    async fn on_resend(&mut self) -> Result<(), ProtocolError> {
        self.broadcast_wish();
        // retry any target a failed write left behind
        self.advance().await
    }

    async fn on_progress_timeout(&mut self) -> Result<(), ProtocolError> {
        info!(
            "Oracle {} saw no progress in epoch {} led by {}",
            self.ctx.id, self.epoch, self.leader
        );
        self.request_next_epoch().await
    }

    async fn request_next_epoch(&mut self) -> Result<(), ProtocolError> {
        self.requested = self.requested.max(self.epoch + 1);
        self.advance().await
    }

    /// The `k`-th largest wish, 1-based
    fn kth_largest_wish(&self, k: usize) -> Epoch {
        let mut wishes = self.wishes.clone();
        wishes.sort_unstable_by(|a, b| b.cmp(a));
        wishes.get(k - 1).copied().unwrap_or(0)
    }

    /// Apply both wish rules and the progress request. Nothing observable
    /// happens unless the resulting state was persisted.
    async fn advance(&mut self) -> Result<(), ProtocolError> {
        let f = self.ctx.config.f;
        let mut target_epoch = self.epoch;
        let switch_to = self.kth_largest_wish(2 * f + 1);
        if switch_to > self.epoch {
            target_epoch = switch_to;
        }
        let target_ne = self
            .ne
            .max(self.requested)
            .max(self.kth_largest_wish(f + 1))
            .max(target_epoch);

        if target_epoch == self.epoch && target_ne == self.ne {
            return Ok(());
        }

        let state = PacemakerState {
            epoch: target_epoch,
            highest_sent_new_epoch_wish: target_ne,
        };
        if !self.persist(state).await {
            return Ok(());
        }

        if target_ne > self.ne {
            self.ne = target_ne;
            self.broadcast_wish();
        }
        if target_epoch > self.epoch {
            self.enter_epoch(target_epoch).await?;
        }
        Ok(())
    }

    async fn persist(&self, state: PacemakerState) -> bool {
        let cd = self.ctx.config.config_digest;
        let result = db::with_timeout(
            &self.ctx.database,
            self.ctx.local.database_timeout(),
            move |db| db.write_state(cd, &state),
        )
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Oracle {} failed to persist pacemaker state {:?}: {}",
                    self.ctx.id, state, e
                );
                false
            }
        }
    }

    fn broadcast_wish(&mut self) {
        self.ctx
            .network
            .broadcast(&PacemakerMessage::NewEpochWish { epoch: self.ne }.into());
        self.resend.arm(self.ctx.config.delta_resend());
    }

    async fn enter_epoch(&mut self, epoch: Epoch) -> Result<(), ProtocolError> {
        self.epoch = epoch;
        self.leader = leader(epoch, self.ctx.config.n(), &self.ctx.config.leader_key);
        self.progress.arm(self.ctx.config.delta_progress());
        info!(
            "Oracle {} entered epoch {} with leader {}",
            self.ctx.id, self.epoch, self.leader
        );
        self.to_outcome_generation
            .send(EpochStartEvent {
                epoch,
                leader: self.leader,
            })
            .await
            .map_err(|_| ProtocolError::ChannelClosed("outcome generation"))
    }
}
