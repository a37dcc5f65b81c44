//! Cluster integration tests
//!
//! Four oracles with F = 1 run end to end over the in-memory network.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use orca_core::{hash_blake3, OracleId};
use orca_protocol::mocks::FlakyDatabase;
use orca_protocol::schedule::leader;
use orca_protocol::signed_data::{
    outcome_digest, AttributedPrepareSignature, OutcomeGenerationId, PrepareSignature,
};
use orca_protocol::{
    CertifiedPrepare, CertifiedPrepareOrCommit, Database, Message, PacemakerState,
};

const WAIT: Duration = Duration::from_secs(20);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("orca_protocol=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_happy_path_commits_and_transmits() {
    init_tracing();
    let cluster = Cluster::start(4, 1);

    let progressed = cluster
        .wait_for(WAIT, |c| (0..4).all(|i| c.committed_seq_nr(i) >= 3))
        .await;
    assert!(progressed, "cluster did not commit three rounds");

    let transmitted = cluster
        .wait_for(WAIT, |c| {
            c.transmitters
                .iter()
                .all(|t| t.transmissions().iter().any(|tx| tx.seq_nr == 1))
        })
        .await;
    assert!(transmitted, "seq 1 was not transmitted by every oracle");

    for transmitter in &cluster.transmitters {
        for tx in transmitter.transmissions() {
            assert_eq!(tx.config_digest, CD);
            assert_eq!(tx.signers.len(), 2);
            assert!(tx.report.starts_with(b"report:"));
        }
    }

    match cluster.cert(0) {
        Some(CertifiedPrepareOrCommit::Commit(cc)) => {
            assert_eq!(cc.commit_quorum_certificate.len(), 3);
        }
        other => panic!("expected a persisted commit, got {:?}", other),
    }

    assert_agreement(&cluster);
    for result in cluster.stop().await {
        assert!(result.is_ok());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crashed_leader_is_replaced() {
    init_tracing();
    let cluster = Cluster::start(4, 1);
    let first_leader = leader(1, 4, &cluster.config.leader_key);

    let started = cluster
        .wait_for(WAIT, |c| c.committed_seq_nr(first_leader.index()) >= 2)
        .await;
    assert!(started, "first epoch made no progress");

    cluster.network.disconnect(first_leader);
    let survivors: Vec<usize> = (0..4).filter(|i| *i != first_leader.index()).collect();
    let before = survivors
        .iter()
        .map(|i| cluster.committed_seq_nr(*i))
        .max()
        .unwrap_or(0);

    let recovered = cluster
        .wait_for(WAIT, |c| {
            survivors.iter().all(|i| {
                c.committed_seq_nr(*i) >= before + 3
                    && c.pacemaker_state(*i).map_or(false, |s| s.epoch >= 2)
            })
        })
        .await;
    assert!(recovered, "survivors did not move past the crashed leader");

    assert_agreement(&cluster);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_prepared_outcome_is_reproposed_after_restart() {
    init_tracing();
    let config = shared_config(4, 1);
    let outcome = b"prepared before the crash".to_vec();
    let inputs_digest = hash_blake3(b"inputs");
    let ogid = OutcomeGenerationId::new(CD, 2);
    let prepared = CertifiedPrepare {
        prepare_epoch: 2,
        seq_nr: 5,
        outcome_inputs_digest: inputs_digest,
        outcome: outcome.clone(),
        prepare_quorum_certificate: (0..3)
            .map(|i| AttributedPrepareSignature {
                signature: PrepareSignature::sign(
                    ogid,
                    5,
                    &inputs_digest,
                    &outcome_digest(&outcome),
                    &offchain_key(i),
                ),
                signer: OracleId(i as u8),
            })
            .collect(),
    };

    let databases: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::new(FlakyDatabase::default());
            db.write_state(
                CD,
                &PacemakerState {
                    epoch: 3,
                    highest_sent_new_epoch_wish: 3,
                },
            )
            .unwrap();
            db.write_cert(CD, &CertifiedPrepareOrCommit::Prepare(prepared.clone()))
                .unwrap();
            db
        })
        .collect();
    let cluster = Cluster::start_with(config, databases);

    let committed = cluster
        .wait_for(WAIT, |c| (0..4).all(|i| c.committed_seq_nr(i) >= 6))
        .await;
    assert!(committed, "cluster did not resume after the reproposal");

    for plugin in &cluster.plugins {
        assert!(plugin.reports_calls().contains(&(5, outcome.clone())));
        assert!(!plugin.outcome_calls().contains(&5));
        assert!(plugin.outcome_calls().iter().all(|seq_nr| *seq_nr > 5));
    }
    assert_agreement(&cluster);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_follower_still_attests() {
    init_tracing();
    let cluster = Cluster::start(4, 1);
    let isolated = OracleId((leader(1, 4, &cluster.config.leader_key).0 + 1) % 4);
    cluster.network.set_filter(Arc::new(move |from, to, message| {
        let consensus = matches!(message, Message::OutcomeGeneration(_));
        !(consensus && (from == isolated || to == isolated))
    }));

    let transmitted = cluster
        .wait_for(WAIT, |c| {
            c.transmitters[isolated.index()]
                .transmissions()
                .iter()
                .any(|tx| tx.seq_nr >= 2)
        })
        .await;
    assert!(transmitted, "isolated follower never transmitted");

    assert_eq!(cluster.committed_seq_nr(isolated.index()), 0);
    assert!(cluster.plugins[isolated.index()].outcome_calls().is_empty());
    assert!(!cluster.plugins[isolated.index()].reports_calls().is_empty());
    assert_agreement(&cluster);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_resumes_from_persisted_state() {
    init_tracing();
    let cluster = Cluster::start(4, 1);
    let progressed = cluster
        .wait_for(WAIT, |c| (0..4).all(|i| c.committed_seq_nr(i) >= 3))
        .await;
    assert!(progressed);

    let databases = cluster.databases.clone();
    for result in cluster.stop().await {
        assert!(result.is_ok());
    }
    let committed_before: Vec<_> = databases
        .iter()
        .map(|db| match db.read_cert(CD).unwrap() {
            Some(cert) => cert.seq_nr(),
            None => 0,
        })
        .collect();
    let highest = committed_before.iter().copied().max().unwrap_or(0);

    let cluster = Cluster::start_with(shared_config(4, 1), databases);
    let resumed = cluster
        .wait_for(WAIT, |c| (0..4).all(|i| c.committed_seq_nr(i) >= highest + 2))
        .await;
    assert!(resumed, "cluster did not resume after restart");

    for (i, plugin) in cluster.plugins.iter().enumerate() {
        assert!(plugin
            .outcome_calls()
            .iter()
            .all(|seq_nr| *seq_nr > committed_before[i]));
    }
    assert_agreement(&cluster);
    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_database_stalls_only_that_oracle() {
    init_tracing();
    let cluster = Cluster::start(4, 1);
    cluster.databases[3].fail_writes(true);

    let progressed = cluster
        .wait_for(WAIT, |c| (0..3).all(|i| c.committed_seq_nr(i) >= 3))
        .await;
    assert!(progressed, "healthy quorum did not make progress");

    assert!(cluster.pacemaker_state(3).is_none());

    cluster.databases[3].fail_writes(false);
    let recovered = cluster
        .wait_for(WAIT, |c| c.pacemaker_state(3).is_some())
        .await;
    assert!(recovered, "oracle 3 did not recover once writes succeeded");
    assert_agreement(&cluster);
    cluster.stop().await;
}
