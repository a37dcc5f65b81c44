use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use orca_core::{
    AttributedObservation, ConfigDigest, Observation, Outcome, OutcomeContext, Query, Quorum,
    ReportWithInfo, SeqNr,
};
use tracing::warn;

use crate::error::{PluginError, TransmitError};
use crate::events::AttributedOnchainSignature;

/// Domain logic supplied to the protocol.
///
/// `outcome` must be deterministic: honest oracles calling it with the same
/// arguments must obtain identical bytes, or rounds will fail to certify.
pub trait ReportingPlugin: Send + Sync + 'static {
    type ReportInfo: Clone + Debug + Send + Sync + 'static;

    fn query(
        &self,
        ctx: &OutcomeContext,
    ) -> impl Future<Output = Result<Query, PluginError>> + Send;

    fn observation(
        &self,
        ctx: &OutcomeContext,
        query: &Query,
    ) -> impl Future<Output = Result<Observation, PluginError>> + Send;

    fn validate_observation(
        &self,
        ctx: &OutcomeContext,
        query: &Query,
        observation: &AttributedObservation,
    ) -> impl Future<Output = Result<(), PluginError>> + Send;

    fn observation_quorum(&self, ctx: &OutcomeContext, query: &Query) -> Quorum;

    fn outcome(
        &self,
        ctx: &OutcomeContext,
        query: &Query,
        observations: &[AttributedObservation],
    ) -> impl Future<Output = Result<Outcome, PluginError>> + Send;

    fn reports(
        &self,
        seq_nr: SeqNr,
        outcome: &Outcome,
    ) -> impl Future<Output = Result<Vec<ReportWithInfo<Self::ReportInfo>>, PluginError>> + Send;

    fn should_accept_attested_report(
        &self,
        seq_nr: SeqNr,
        report: &ReportWithInfo<Self::ReportInfo>,
    ) -> impl Future<Output = Result<bool, PluginError>> + Send;

    fn should_transmit_accepted_report(
        &self,
        seq_nr: SeqNr,
        report: &ReportWithInfo<Self::ReportInfo>,
    ) -> impl Future<Output = Result<bool, PluginError>> + Send;
}

/// Hands attested reports to the target ledger.
///
/// Implementations queue and retry on their own; returning `Ok` only means
/// the report was accepted for transmission.
pub trait ContractTransmitter<I>: Send + Sync + 'static {
    fn transmit(
        &self,
        config_digest: ConfigDigest,
        seq_nr: SeqNr,
        report: &ReportWithInfo<I>,
        signatures: &[AttributedOnchainSignature],
    ) -> impl Future<Output = Result<(), TransmitError>> + Send;

    /// Account reports are sent from
    fn from_account(&self) -> String;
}

/// Run a plugin call under its deadline.
///
/// Failures are logged and reported as `None`; the caller abandons the
/// current phase.
pub(crate) async fn call_plugin<T>(
    name: &'static str,
    max_duration: Duration,
    call: impl Future<Output = Result<T, PluginError>>,
) -> Option<T> {
    match tokio::time::timeout(max_duration, call).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!("Plugin call {} failed: {}", name, e);
            None
        }
        Err(_) => {
            warn!(
                "Plugin call {} timed out after {}ms",
                name,
                max_duration.as_millis()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_plugin_outcomes() {
        let ok = call_plugin("query", Duration::from_millis(50), async { Ok(7u8) }).await;
        assert_eq!(ok, Some(7));

        let failed = call_plugin("query", Duration::from_millis(50), async {
            Err::<u8, _>(PluginError::new("boom"))
        })
        .await;
        assert_eq!(failed, None);

        let slow = call_plugin("query", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1u8)
        })
        .await;
        assert_eq!(slow, None);
    }
}
