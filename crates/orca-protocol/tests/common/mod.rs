//! Local clusters of oracles over the in-memory network

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use orca_core::{ConfigDigest, KeyPair, OracleId, Outcome, SeqNr};
use orca_protocol::mocks::{FlakyDatabase, MockPlugin, RecordingTransmitter};
use orca_protocol::{
    run_oracle, CertifiedPrepareOrCommit, Database, Ed25519OnchainKeyring, InMemoryNetwork,
    LocalConfig, OracleArgs, OracleIdentity, PacemakerState, ProtocolError, SharedConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CD: ConfigDigest = ConfigDigest([7u8; 32]);

pub fn offchain_key(i: usize) -> KeyPair {
    KeyPair::derive(b"cluster", "offchain", i as u64)
}

pub fn onchain_key(i: usize) -> KeyPair {
    KeyPair::derive(b"cluster", "onchain", i as u64)
}

pub fn shared_config(n: usize, f: usize) -> SharedConfig {
    SharedConfig {
        config_digest: CD,
        f,
        oracles: (0..n)
            .map(|i| OracleIdentity {
                offchain_public_key: offchain_key(i).public,
                onchain_public_key: onchain_key(i).public.as_bytes().to_vec(),
            })
            .collect(),
        delta_progress_ms: 1_500,
        delta_resend_ms: 300,
        delta_round_ms: 100,
        delta_grace_ms: 20,
        delta_certified_commit_request_ms: 200,
        delta_stage_ms: 50,
        r_max: 50,
        transmission_schedule: vec![1; n],
        leader_key: [5u8; 32],
        transmission_key: [6u8; 32],
        max_query_length: 1024,
        max_observation_length: 1024,
        max_outcome_length: 4096,
        max_report_count: 8,
    }
}

pub fn local_config() -> LocalConfig {
    LocalConfig {
        database_timeout_ms: 1_000,
        persist_retry_backoff_ms: 10,
        verify_workers: 2,
        ..Default::default()
    }
}

pub struct Cluster {
    pub config: SharedConfig,
    pub network: Arc<InMemoryNetwork>,
    pub plugins: Vec<Arc<MockPlugin>>,
    pub transmitters: Vec<Arc<RecordingTransmitter>>,
    pub databases: Vec<Arc<FlakyDatabase>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<Result<(), ProtocolError>>>,
}

impl Cluster {
    pub fn start(n: usize, f: usize) -> Self {
        let databases = (0..n).map(|_| Arc::new(FlakyDatabase::default())).collect();
        Self::start_with(shared_config(n, f), databases)
    }

    /// Start one oracle per database, resuming from whatever they hold
    pub fn start_with(config: SharedConfig, databases: Vec<Arc<FlakyDatabase>>) -> Self {
        let n = config.n();
        let (network, inboxes) = InMemoryNetwork::new(n, 4_096);
        let cancel = CancellationToken::new();
        let plugins: Vec<_> = (0..n).map(|_| Arc::new(MockPlugin::default())).collect();
        let transmitters: Vec<_> = (0..n)
            .map(|_| Arc::new(RecordingTransmitter::default()))
            .collect();

        let handles = inboxes
            .into_iter()
            .enumerate()
            .map(|(i, inbox)| {
                let args = OracleArgs {
                    id: OracleId(i as u8),
                    shared_config: config.clone(),
                    local_config: local_config(),
                    plugin: plugins[i].clone(),
                    offchain_keyring: Arc::new(offchain_key(i)),
                    onchain_keyring: Arc::new(Ed25519OnchainKeyring::new(onchain_key(i))),
                    contract_transmitter: transmitters[i].clone(),
                    database: databases[i].clone() as Arc<dyn Database>,
                    network: Arc::new(network.endpoint(OracleId(i as u8))),
                    inbox,
                };
                tokio::spawn(run_oracle(args, cancel.clone()))
            })
            .collect();

        Cluster {
            config,
            network,
            plugins,
            transmitters,
            databases,
            cancel,
            handles,
        }
    }

    /// Poll `condition` until it holds or `timeout` passes
    pub async fn wait_for(&self, timeout: Duration, condition: impl Fn(&Cluster) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition(self)
    }

    pub fn cert(&self, i: usize) -> Option<CertifiedPrepareOrCommit> {
        self.databases[i].read_cert(CD).unwrap()
    }

    pub fn pacemaker_state(&self, i: usize) -> Option<PacemakerState> {
        self.databases[i].read_state(CD).unwrap()
    }

    /// Highest sequence number oracle `i` has durably committed
    pub fn committed_seq_nr(&self, i: usize) -> SeqNr {
        match self.cert(i) {
            Some(CertifiedPrepareOrCommit::Commit(cc)) => cc.seq_nr,
            Some(CertifiedPrepareOrCommit::Prepare(cp)) => cp.seq_nr - 1,
            None => 0,
        }
    }

    /// Every outcome handed to report generation, by any oracle
    pub fn delivered_outcomes(&self) -> Vec<(SeqNr, Outcome)> {
        self.plugins
            .iter()
            .flat_map(|plugin| plugin.reports_calls())
            .collect()
    }

    /// Stop every oracle and return how each one ended
    pub async fn stop(self) -> Vec<Result<(), ProtocolError>> {
        self.cancel.cancel();
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            results.push(handle.await.unwrap());
        }
        results
    }
}

/// No two oracles delivered different outcomes for the same sequence number
pub fn assert_agreement(cluster: &Cluster) {
    let mut delivered = std::collections::BTreeMap::new();
    for (seq_nr, outcome) in cluster.delivered_outcomes() {
        let first = delivered.entry(seq_nr).or_insert_with(|| outcome.clone());
        assert_eq!(*first, outcome, "conflicting outcomes for seq {}", seq_nr);
    }
}
