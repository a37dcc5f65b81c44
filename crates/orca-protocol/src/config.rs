use std::time::Duration;

use orca_core::{ConfigDigest, OracleId, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Public identities of one oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleIdentity {
    /// Signs and verifies protocol messages
    pub offchain_public_key: PublicKey,
    /// Signs and verifies reports, in the target ledger's scheme
    pub onchain_public_key: Vec<u8>,
}

/// Configuration shared by every oracle of one protocol instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    pub config_digest: ConfigDigest,
    /// Maximum number of Byzantine oracles tolerated
    pub f: usize,
    pub oracles: Vec<OracleIdentity>,

    /// Time without progress before an oracle wishes for a new epoch
    pub delta_progress_ms: u64,
    /// Interval at which NewEpochWish messages are re-broadcast
    pub delta_resend_ms: u64,
    /// Minimum interval between rounds, and the leader's round retry timeout
    pub delta_round_ms: u64,
    /// Extra time the leader waits for observations after reaching quorum
    pub delta_grace_ms: u64,
    /// Time to wait for a certified commit before asking another peer
    pub delta_certified_commit_request_ms: u64,
    /// Delay between consecutive transmission stages
    pub delta_stage_ms: u64,

    /// Maximum number of rounds per epoch
    pub r_max: u64,
    /// Stage weights of the transmission schedule; must sum to n
    pub transmission_schedule: Vec<usize>,

    pub leader_key: [u8; 32],
    pub transmission_key: [u8; 32],

    pub max_query_length: usize,
    pub max_observation_length: usize,
    pub max_outcome_length: usize,
    pub max_report_count: usize,
}

impl SharedConfig {
    pub fn n(&self) -> usize {
        self.oracles.len()
    }

    /// Minimum number of distinct signers of a quorum certificate
    pub fn byz_quorum_size(&self) -> usize {
        2 * self.f + 1
    }

    pub fn offchain_public_keys(&self) -> Vec<PublicKey> {
        self.oracles.iter().map(|o| o.offchain_public_key).collect()
    }

    pub fn identity(&self, id: OracleId) -> Option<&OracleIdentity> {
        self.oracles.get(id.index())
    }

    pub fn delta_progress(&self) -> Duration {
        Duration::from_millis(self.delta_progress_ms)
    }

    pub fn delta_resend(&self) -> Duration {
        Duration::from_millis(self.delta_resend_ms)
    }

    pub fn delta_round(&self) -> Duration {
        Duration::from_millis(self.delta_round_ms)
    }

    pub fn delta_grace(&self) -> Duration {
        Duration::from_millis(self.delta_grace_ms)
    }

    pub fn delta_certified_commit_request(&self) -> Duration {
        Duration::from_millis(self.delta_certified_commit_request_ms)
    }

    pub fn delta_stage(&self) -> Duration {
        Duration::from_millis(self.delta_stage_ms)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        let n = self.n();
        if n == 0 || n > u8::MAX as usize {
            return Err(ProtocolError::Config(format!(
                "oracle count {} outside [1, {}]",
                n,
                u8::MAX
            )));
        }
        if n <= 3 * self.f {
            return Err(ProtocolError::Config(format!(
                "n = {} must exceed 3f = {}",
                n,
                3 * self.f
            )));
        }
        if self.r_max == 0 {
            return Err(ProtocolError::Config("r_max must be positive".into()));
        }
        if self.delta_grace_ms >= self.delta_round_ms {
            return Err(ProtocolError::Config(
                "delta_grace must be shorter than delta_round".into(),
            ));
        }
        if self.delta_round_ms >= self.delta_progress_ms {
            return Err(ProtocolError::Config(
                "delta_round must be shorter than delta_progress".into(),
            ));
        }
        if self.delta_resend_ms == 0 {
            return Err(ProtocolError::Config("delta_resend must be positive".into()));
        }
        let weight: usize = self.transmission_schedule.iter().sum();
        if weight != n {
            return Err(ProtocolError::Config(format!(
                "transmission schedule weights sum to {}, expected {}",
                weight, n
            )));
        }
        let mut keys = self.offchain_public_keys();
        keys.sort();
        keys.dedup();
        if keys.len() != n {
            return Err(ProtocolError::Config(
                "offchain public keys must be distinct".into(),
            ));
        }
        Ok(())
    }
}

/// Per-node operational settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub database_timeout_ms: u64,
    /// Initial backoff between persistence retries; doubles up to 32x
    pub persist_retry_backoff_ms: u64,

    pub max_duration_query_ms: u64,
    pub max_duration_observation_ms: u64,
    pub max_duration_validate_observation_ms: u64,
    pub max_duration_outcome_ms: u64,
    pub max_duration_reports_ms: u64,
    pub max_duration_should_accept_ms: u64,
    pub max_duration_should_transmit_ms: u64,
    pub max_duration_transmit_ms: u64,

    /// Capacity of every inter-component mailbox
    pub channel_capacity: usize,
    /// Future-epoch messages buffered per sender
    pub epoch_buffer_capacity: usize,
    /// Upper bound on report-verification threads
    pub verify_workers: usize,
    /// Largest inbound frame accepted from the network
    pub max_message_size: usize,

    pub attestation_expiry_ms: u64,
    pub attestation_lookahead_ms: u64,
    pub min_expiry_rounds: u64,
    pub max_expiry_rounds: u64,
    pub min_lookahead_rounds: u64,
    pub max_lookahead_rounds: u64,
    pub reap_interval_ms: u64,
}

impl Default for LocalConfig {
    fn default() -> Self {
        LocalConfig {
            database_timeout_ms: 10_000,
            persist_retry_backoff_ms: 50,
            max_duration_query_ms: 1_000,
            max_duration_observation_ms: 1_000,
            max_duration_validate_observation_ms: 500,
            max_duration_outcome_ms: 1_000,
            max_duration_reports_ms: 1_000,
            max_duration_should_accept_ms: 1_000,
            max_duration_should_transmit_ms: 1_000,
            max_duration_transmit_ms: 5_000,
            channel_capacity: 1_024,
            epoch_buffer_capacity: 10,
            verify_workers: 4,
            max_message_size: 4 * 1024 * 1024,
            attestation_expiry_ms: 120_000,
            attestation_lookahead_ms: 20_000,
            min_expiry_rounds: 10,
            max_expiry_rounds: 1_000,
            min_lookahead_rounds: 4,
            max_lookahead_rounds: 8,
            reap_interval_ms: 10_000,
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

impl LocalConfig {
    pub fn database_timeout(&self) -> Duration {
        millis(self.database_timeout_ms)
    }

    pub fn persist_retry_backoff(&self) -> Duration {
        millis(self.persist_retry_backoff_ms)
    }

    pub fn max_duration_query(&self) -> Duration {
        millis(self.max_duration_query_ms)
    }

    pub fn max_duration_observation(&self) -> Duration {
        millis(self.max_duration_observation_ms)
    }

    pub fn max_duration_validate_observation(&self) -> Duration {
        millis(self.max_duration_validate_observation_ms)
    }

    pub fn max_duration_outcome(&self) -> Duration {
        millis(self.max_duration_outcome_ms)
    }

    pub fn max_duration_reports(&self) -> Duration {
        millis(self.max_duration_reports_ms)
    }

    pub fn max_duration_should_accept(&self) -> Duration {
        millis(self.max_duration_should_accept_ms)
    }

    pub fn max_duration_should_transmit(&self) -> Duration {
        millis(self.max_duration_should_transmit_ms)
    }

    pub fn max_duration_transmit(&self) -> Duration {
        millis(self.max_duration_transmit_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        millis(self.reap_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.channel_capacity == 0 || self.epoch_buffer_capacity == 0 {
            return Err(ProtocolError::Config(
                "channel and epoch buffer capacities must be positive".into(),
            ));
        }
        if self.verify_workers == 0 {
            return Err(ProtocolError::Config("verify_workers must be positive".into()));
        }
        if self.min_expiry_rounds > self.max_expiry_rounds
            || self.min_lookahead_rounds > self.max_lookahead_rounds
        {
            return Err(ProtocolError::Config(
                "attestation round bounds are inverted".into(),
            ));
        }
        if self.max_lookahead_rounds >= self.min_expiry_rounds {
            return Err(ProtocolError::Config(
                "attestation lookahead must stay below the expiry horizon".into(),
            ));
        }
        Ok(())
    }
}

/// Range of sequence numbers report attestation keeps state for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttestationWindow {
    pub expiry_rounds: u64,
    pub lookahead_rounds: u64,
}

impl AttestationWindow {
    pub fn new(shared: &SharedConfig, local: &LocalConfig) -> Self {
        let min_round_interval = shared.delta_round_ms.max(1);
        let expiry_rounds = (local.attestation_expiry_ms / min_round_interval)
            .clamp(local.min_expiry_rounds, local.max_expiry_rounds);
        let lookahead_rounds = (local.attestation_lookahead_ms / min_round_interval)
            .clamp(local.min_lookahead_rounds, local.max_lookahead_rounds);
        AttestationWindow {
            expiry_rounds,
            lookahead_rounds,
        }
    }

    /// Lowest sequence number still tracked
    pub fn lower_bound(&self, highest_attested: u64) -> u64 {
        highest_attested.saturating_sub(self.expiry_rounds)
    }

    /// Highest sequence number accepted from peers
    pub fn upper_bound(&self, highest_known: u64) -> u64 {
        highest_known.saturating_add(self.lookahead_rounds)
    }
}
