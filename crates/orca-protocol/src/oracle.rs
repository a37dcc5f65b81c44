//! Wiring of one oracle instance and the inbound message dispatcher.

use std::sync::Arc;

use orca_core::OracleId;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{LocalConfig, SharedConfig};
use crate::db::Database;
use crate::error::ProtocolError;
use crate::keyring::{OffchainKeyring, OnchainKeyring};
use crate::messages::{
    Message, OutcomeGenerationMessage, PacemakerMessage, ReportAttestationMessage,
};
use crate::network::{Inbox, NetworkEndpoint};
use crate::outcome_generation::OutcomeGeneration;
use crate::pacemaker::Pacemaker;
use crate::plugin::{ContractTransmitter, ReportingPlugin};
use crate::report_attestation::ReportAttestation;
use crate::transmission::Transmission;

/// Everything a component needs besides its own channels
#[derive(Clone)]
pub(crate) struct OracleContext {
    pub id: OracleId,
    pub config: Arc<SharedConfig>,
    pub local: Arc<LocalConfig>,
    pub network: Arc<dyn NetworkEndpoint>,
    pub database: Arc<dyn Database>,
    pub cancel: CancellationToken,
}

/// Inputs of one oracle instance
pub struct OracleArgs<P: ReportingPlugin, T> {
    pub id: OracleId,
    pub shared_config: SharedConfig,
    pub local_config: LocalConfig,
    pub plugin: Arc<P>,
    pub offchain_keyring: Arc<dyn OffchainKeyring>,
    pub onchain_keyring: Arc<dyn OnchainKeyring<P::ReportInfo>>,
    pub contract_transmitter: Arc<T>,
    pub database: Arc<dyn Database>,
    pub network: Arc<dyn NetworkEndpoint>,
    pub inbox: Inbox,
}

/// Routes decoded frames to the component mailboxes
struct Dispatcher {
    config: Arc<SharedConfig>,
    max_message_size: usize,
    max_signature_length: usize,
    to_pacemaker: mpsc::Sender<(OracleId, PacemakerMessage)>,
    to_outcome_generation: mpsc::Sender<(OracleId, OutcomeGenerationMessage)>,
    to_report_attestation: mpsc::Sender<(OracleId, ReportAttestationMessage)>,
}

impl Dispatcher {
    fn route(&self, sender: OracleId, frame: &[u8]) -> Result<(), ProtocolError> {
        if sender.index() >= self.config.n() {
            return Err(ProtocolError::Invariant(format!(
                "transport delivered a frame from unknown oracle {}",
                sender
            )));
        }
        let message = match Message::decode(frame, self.max_message_size) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping undecodable frame from {}: {}", sender, e);
                return Ok(());
            }
        };
        if let Err(e) = message.check_limits(&self.config, self.max_signature_length) {
            debug!("Dropping oversized message from {}: {}", sender, e);
            return Ok(());
        }

        match message {
            Message::Pacemaker(message) => forward(&self.to_pacemaker, sender, message, "pacemaker"),
            Message::OutcomeGeneration(message) => forward(
                &self.to_outcome_generation,
                sender,
                message,
                "outcome generation",
            ),
            Message::ReportAttestation(message) => forward(
                &self.to_report_attestation,
                sender,
                message,
                "report attestation",
            ),
        }
    }
}

fn forward<M>(
    mailbox: &mpsc::Sender<(OracleId, M)>,
    sender: OracleId,
    message: M,
    component: &'static str,
) -> Result<(), ProtocolError> {
    match mailbox.try_send((sender, message)) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(_)) => {
            debug!("Mailbox of {} full, dropping message from {}", component, sender);
            Ok(())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => Err(ProtocolError::ChannelClosed(component)),
    }
}

fn check_identity<P: ReportingPlugin, T>(args: &OracleArgs<P, T>) -> Result<(), ProtocolError> {
    args.shared_config.validate()?;
    args.local_config.validate()?;
    let identity = args.shared_config.identity(args.id).ok_or_else(|| {
        ProtocolError::Config(format!(
            "oracle {} not in a configuration of {} oracles",
            args.id,
            args.shared_config.n()
        ))
    })?;
    if args.offchain_keyring.public_key() != identity.offchain_public_key {
        return Err(ProtocolError::Config(format!(
            "offchain key of oracle {} does not match the configuration",
            args.id
        )));
    }
    if args.onchain_keyring.public_key() != identity.onchain_public_key {
        return Err(ProtocolError::Config(format!(
            "onchain key of oracle {} does not match the configuration",
            args.id
        )));
    }
    Ok(())
}

fn verifier_pool(workers: usize) -> Result<rayon::ThreadPool, ProtocolError> {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    rayon::ThreadPoolBuilder::new()
        .num_threads(cores.min(workers).max(1))
        .thread_name(|i| format!("orca-verify-{}", i))
        .build()
        .map_err(|e| ProtocolError::VerifierPool(e.to_string()))
}

/// Run one oracle until `cancel` fires or a component fails.
///
/// A failing component cancels the others; its error is returned once all
/// of them have stopped.
pub async fn run_oracle<P, T>(
    args: OracleArgs<P, T>,
    cancel: CancellationToken,
) -> Result<(), ProtocolError>
where
    P: ReportingPlugin,
    T: ContractTransmitter<P::ReportInfo>,
{
    check_identity(&args)?;

    let OracleArgs {
        id,
        shared_config,
        local_config,
        plugin,
        offchain_keyring,
        onchain_keyring,
        contract_transmitter,
        database,
        network,
        mut inbox,
    } = args;

    let cancel = cancel.child_token();
    let capacity = local_config.channel_capacity;
    let verifier = Arc::new(verifier_pool(local_config.verify_workers)?);
    let ctx = OracleContext {
        id,
        config: Arc::new(shared_config),
        local: Arc::new(local_config),
        network,
        database,
        cancel: cancel.clone(),
    };

    let (to_pacemaker, pacemaker_inbox) = mpsc::channel(capacity);
    let (to_outcome_generation, outcome_generation_inbox) = mpsc::channel(capacity);
    let (to_report_attestation, report_attestation_inbox) = mpsc::channel(capacity);
    let (pacemaker_events_tx, pacemaker_events) = mpsc::channel(capacity);
    let (epoch_starts_tx, epoch_starts) = mpsc::channel(capacity);
    let (committed_tx, committed) = mpsc::channel(capacity);
    let (attested_tx, attested) = mpsc::channel(capacity);

    let dispatcher = Dispatcher {
        config: ctx.config.clone(),
        max_message_size: ctx.local.max_message_size,
        max_signature_length: onchain_keyring.max_signature_length(),
        to_pacemaker,
        to_outcome_generation,
        to_report_attestation,
    };

    let pacemaker = Pacemaker::new(
        ctx.clone(),
        pacemaker_inbox,
        pacemaker_events,
        epoch_starts_tx,
    );
    let outcome_generation = OutcomeGeneration::new(
        ctx.clone(),
        plugin.clone(),
        offchain_keyring,
        outcome_generation_inbox,
        epoch_starts,
        pacemaker_events_tx,
        committed_tx,
    );
    let report_attestation = ReportAttestation::new(
        ctx.clone(),
        plugin.clone(),
        onchain_keyring,
        verifier,
        report_attestation_inbox,
        committed,
        attested_tx,
    );
    let transmission = Transmission::new(ctx.clone(), plugin, contract_transmitter, attested);

    let mut components = JoinSet::new();
    components.spawn(async move { ("pacemaker", pacemaker.run().await) });
    components.spawn(async move { ("outcome generation", outcome_generation.run().await) });
    components.spawn(async move { ("report attestation", report_attestation.run().await) });
    components.spawn(async move { ("transmission", transmission.run().await) });
    info!("Oracle {} started", id);

    let mut failure = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some((sender, frame)) = inbox.recv() => {
                if let Err(e) = dispatcher.route(sender, &frame) {
                    let shutting_down =
                        cancel.is_cancelled() && matches!(e, ProtocolError::ChannelClosed(_));
                    if !shutting_down {
                        failure = Some(e);
                    }
                    break;
                }
            }
            Some(joined) = components.join_next() => {
                failure = component_failure(joined, &cancel);
                if failure.is_some() {
                    break;
                }
            }
        }
    }

    cancel.cancel();
    while let Some(joined) = components.join_next().await {
        if let Some(e) = component_failure(joined, &cancel) {
            failure.get_or_insert(e);
        }
    }

    match failure {
        Some(e) => {
            error!("Oracle {} stopped: {}", id, e);
            Err(e)
        }
        None => {
            info!("Oracle {} stopped", id);
            Ok(())
        }
    }
}

/// The error a finished component should abort the instance with, if any
fn component_failure(
    joined: Result<(&'static str, Result<(), ProtocolError>), tokio::task::JoinError>,
    cancel: &CancellationToken,
) -> Option<ProtocolError> {
    match joined {
        Ok((_, Ok(()))) if cancel.is_cancelled() => None,
        Ok((name, Ok(()))) => Some(ProtocolError::Invariant(format!("{} exited early", name))),
        Ok((_, Err(ProtocolError::ChannelClosed(_)))) if cancel.is_cancelled() => None,
        Ok((_, Err(e))) => Some(e),
        Err(e) => Some(ProtocolError::Invariant(format!("component task failed: {}", e))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use orca_core::KeyPair;

    use super::*;
    use crate::config::tests::shared_config;
    use crate::keyring::Ed25519OnchainKeyring;
    use crate::mocks::{FlakyDatabase, MockPlugin, RecordingEndpoint, RecordingTransmitter};

    pub(crate) fn context(
        n: usize,
        f: usize,
        id: OracleId,
        network: Arc<dyn NetworkEndpoint>,
        database: Arc<dyn Database>,
    ) -> OracleContext {
        OracleContext {
            id,
            config: Arc::new(shared_config(n, f)),
            local: Arc::new(LocalConfig {
                persist_retry_backoff_ms: 5,
                ..Default::default()
            }),
            network,
            database,
            cancel: CancellationToken::new(),
        }
    }

    fn oracle_args(
        id: u8,
        keys_of: u64,
    ) -> (
        OracleArgs<MockPlugin, RecordingTransmitter>,
        mpsc::Sender<(OracleId, Vec<u8>)>,
    ) {
        let (frames, inbox) = mpsc::channel(16);
        let args = OracleArgs {
            id: OracleId(id),
            shared_config: shared_config(4, 1),
            local_config: LocalConfig::default(),
            plugin: Arc::new(MockPlugin::default()),
            offchain_keyring: Arc::new(KeyPair::derive(b"cfg", "offchain", keys_of)),
            onchain_keyring: Arc::new(Ed25519OnchainKeyring::new(KeyPair::derive(
                b"cfg", "onchain", keys_of,
            ))),
            contract_transmitter: Arc::new(RecordingTransmitter::default()),
            database: Arc::new(FlakyDatabase::default()),
            network: Arc::new(RecordingEndpoint::default()),
            inbox,
        };
        (args, frames)
    }

    #[tokio::test]
    async fn test_rejects_foreign_keys() {
        let (args, _frames) = oracle_args(1, 2);
        let result = run_oracle(args, CancellationToken::new()).await;
        assert!(matches!(result, Err(ProtocolError::Config(_))));

        let (mut args, _frames) = oracle_args(1, 1);
        args.id = OracleId(4);
        let result = run_oracle(args, CancellationToken::new()).await;
        assert!(matches!(result, Err(ProtocolError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let (args, _frames) = oracle_args(0, 0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run_oracle(args, cancel))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_frame_from_unknown_sender_aborts() {
        let (args, frames) = oracle_args(0, 0);
        frames.send((OracleId(9), Vec::new())).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_oracle(args, CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(ProtocolError::Invariant(_))));
    }

    #[tokio::test]
    async fn test_garbage_frames_are_dropped() {
        let (args, frames) = oracle_args(0, 0);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_oracle(args, cancel.clone()));
        frames.send((OracleId(2), vec![0xff; 7])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
