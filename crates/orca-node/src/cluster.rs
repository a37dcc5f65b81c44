//! A full cluster of oracles in one process, connected by the in-memory
//! network and persisting to one file per oracle.

use std::sync::Arc;

use anyhow::{bail, Result};
use orca_core::OracleId;
use orca_protocol::{
    run_oracle, CertifiedPrepareOrCommit, Database, Ed25519OnchainKeyring, InMemoryNetwork,
    KvDatabase, OracleArgs, PacemakerState,
};
use orca_store::FileStorage;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ClusterConfig;
use crate::plugin::MedianPlugin;
use crate::transmitter::LoggingTransmitter;

pub struct LocalCluster {
    config: ClusterConfig,
}

impl LocalCluster {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.shared_config()?;
        Ok(LocalCluster { config })
    }

    /// Run every oracle until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.config;
        let shared = config.shared_config()?;
        let n = shared.n();
        std::fs::create_dir_all(&config.data_dir)?;

        let (network, inboxes) = InMemoryNetwork::new(n, config.local.channel_capacity);
        let mut oracles = JoinSet::new();
        for (i, ((offchain, onchain), inbox)) in
            config.keypairs()?.into_iter().zip(inboxes).enumerate()
        {
            let id = OracleId(i as u8);
            let storage = FileStorage::open(config.database_path(i))?;
            let args = OracleArgs {
                id,
                shared_config: shared.clone(),
                local_config: config.local.clone(),
                plugin: Arc::new(MedianPlugin::new(config.feed.clone())),
                offchain_keyring: Arc::new(offchain),
                onchain_keyring: Arc::new(Ed25519OnchainKeyring::new(onchain)),
                contract_transmitter: Arc::new(LoggingTransmitter::new(id)),
                database: Arc::new(KvDatabase::new(storage)),
                network: Arc::new(network.endpoint(id)),
                inbox,
            };
            let cancel = cancel.clone();
            oracles.spawn(async move { (id, run_oracle(args, cancel).await) });
        }
        info!(
            "Started {} oracles tolerating {} faults, config {}",
            n, shared.f, shared.config_digest
        );

        let mut failed = 0;
        while let Some(joined) = oracles.join_next().await {
            match joined {
                Ok((id, Ok(()))) => info!("Oracle {} stopped", id),
                Ok((id, Err(e))) => {
                    error!("Oracle {} failed: {}", id, e);
                    failed += 1;
                }
                Err(e) => {
                    error!("Oracle task failed: {}", e);
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            bail!("{} of {} oracles failed", failed, n);
        }
        Ok(())
    }
}

/// Durable state of one oracle
#[derive(Debug)]
pub struct OracleStatus {
    pub id: OracleId,
    pub state: Option<PacemakerState>,
    pub cert: Option<CertifiedPrepareOrCommit>,
}

/// Read what each oracle has persisted, without starting any of them
pub fn inspect(config: &ClusterConfig) -> Result<Vec<OracleStatus>> {
    let config_digest = config.config_digest()?;
    (0..config.oracles.len())
        .map(|i| {
            let path = config.database_path(i);
            let database = KvDatabase::new(FileStorage::open(path)?);
            Ok(OracleStatus {
                id: OracleId(i as u8),
                state: database.read_state(config_digest)?,
                cert: database.read_cert(config_digest)?,
            })
        })
        .collect()
}
