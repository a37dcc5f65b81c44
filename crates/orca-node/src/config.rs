use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use orca_core::{ConfigDigest, KeyPair, SecretKey};
use orca_protocol::{LocalConfig, OracleIdentity, SharedConfig};
use serde::{Deserialize, Serialize};

/// Configuration of a local cluster of oracles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Directory holding one database file per oracle
    pub data_dir: PathBuf,

    /// Configuration digest (hex)
    pub config_digest: String,

    /// Number of faulty oracles tolerated
    pub faulty: usize,

    pub oracles: Vec<OracleKeys>,

    pub protocol: ProtocolParams,

    /// Per-node settings, shared by every oracle of the cluster
    #[serde(default)]
    pub local: LocalConfig,

    pub feed: FeedConfig,
}

/// Secret keys of one oracle (hex)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleKeys {
    pub offchain_secret: String,
    pub onchain_secret: String,
}

/// Protocol timings and bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolParams {
    pub delta_progress_ms: u64,
    pub delta_resend_ms: u64,
    pub delta_round_ms: u64,
    pub delta_grace_ms: u64,
    pub delta_certified_commit_request_ms: u64,
    pub delta_stage_ms: u64,
    pub r_max: u64,
    /// Oracles transmitting per stage; defaults to one per stage
    #[serde(default)]
    pub transmission_schedule: Vec<usize>,
    /// Leader selection key (hex)
    pub leader_key: String,
    /// Transmission schedule key (hex)
    pub transmission_key: String,
    pub max_query_length: usize,
    pub max_observation_length: usize,
    pub max_outcome_length: usize,
    pub max_report_count: usize,
}

/// Parameters of the demo price feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Price every observation is drawn around
    pub base_price: u64,
    /// Maximum deviation of one observation from the base price
    pub spread: u64,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        ProtocolParams {
            delta_progress_ms: 5_000,
            delta_resend_ms: 1_000,
            delta_round_ms: 1_000,
            delta_grace_ms: 200,
            delta_certified_commit_request_ms: 500,
            delta_stage_ms: 2_000,
            r_max: 20,
            transmission_schedule: Vec::new(),
            leader_key: hex::encode([0u8; 32]),
            transmission_key: hex::encode([0u8; 32]),
            max_query_length: 1024,
            max_observation_length: 1024,
            max_outcome_length: 4096,
            max_report_count: 4,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            base_price: 100_000,
            spread: 500,
        }
    }
}

fn parse_key(field: &str, value: &str) -> Result<[u8; 32]> {
    hex::decode(value)?
        .try_into()
        .map_err(|_| anyhow!("{} must be 32 bytes of hex", field))
}

impl ClusterConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_digest(&self) -> Result<ConfigDigest> {
        Ok(ConfigDigest::from_hex(&self.config_digest)?)
    }

    /// Offchain and onchain key pairs, by oracle index
    pub fn keypairs(&self) -> Result<Vec<(KeyPair, KeyPair)>> {
        self.oracles
            .iter()
            .map(|keys| {
                let offchain = KeyPair::from_secret(SecretKey::from_hex(&keys.offchain_secret)?);
                let onchain = KeyPair::from_secret(SecretKey::from_hex(&keys.onchain_secret)?);
                Ok((offchain, onchain))
            })
            .collect()
    }

    pub fn database_path(&self, index: usize) -> PathBuf {
        self.data_dir.join(format!("oracle-{}.db", index))
    }

    /// Build the validated configuration every oracle shares
    pub fn shared_config(&self) -> Result<SharedConfig> {
        let n = self.oracles.len();
        let protocol = &self.protocol;
        let transmission_schedule = if protocol.transmission_schedule.is_empty() {
            vec![1; n]
        } else {
            protocol.transmission_schedule.clone()
        };

        let shared = SharedConfig {
            config_digest: self.config_digest()?,
            f: self.faulty,
            oracles: self
                .keypairs()?
                .iter()
                .map(|(offchain, onchain)| OracleIdentity {
                    offchain_public_key: offchain.public,
                    onchain_public_key: onchain.public.as_bytes().to_vec(),
                })
                .collect(),
            delta_progress_ms: protocol.delta_progress_ms,
            delta_resend_ms: protocol.delta_resend_ms,
            delta_round_ms: protocol.delta_round_ms,
            delta_grace_ms: protocol.delta_grace_ms,
            delta_certified_commit_request_ms: protocol.delta_certified_commit_request_ms,
            delta_stage_ms: protocol.delta_stage_ms,
            r_max: protocol.r_max,
            transmission_schedule,
            leader_key: parse_key("leader_key", &protocol.leader_key)?,
            transmission_key: parse_key("transmission_key", &protocol.transmission_key)?,
            max_query_length: protocol.max_query_length,
            max_observation_length: protocol.max_observation_length,
            max_outcome_length: protocol.max_outcome_length,
            max_report_count: protocol.max_report_count,
        };
        shared.validate()?;
        self.local.validate()?;
        Ok(shared)
    }
}

/// Sample cluster with keys derived from `seed`, reproducible across runs
pub fn generate_sample_config(oracles: usize, faulty: usize, seed: &str) -> ClusterConfig {
    let seed = seed.as_bytes();
    let digest = orca_core::hash_blake3(&[b"orca/sample-config/".as_slice(), seed].concat());
    let keys = (0..oracles as u64)
        .map(|i| OracleKeys {
            offchain_secret: KeyPair::derive(seed, "offchain", i).secret.to_hex(),
            onchain_secret: KeyPair::derive(seed, "onchain", i).secret.to_hex(),
        })
        .collect();

    ClusterConfig {
        data_dir: PathBuf::from("./orca-data"),
        config_digest: digest.to_hex(),
        faulty,
        oracles: keys,
        protocol: ProtocolParams {
            leader_key: KeyPair::derive(seed, "leader", 0).public.to_hex(),
            transmission_key: KeyPair::derive(seed, "transmission", 0).public.to_hex(),
            ..Default::default()
        },
        local: LocalConfig::default(),
        feed: FeedConfig::default(),
    }
}
