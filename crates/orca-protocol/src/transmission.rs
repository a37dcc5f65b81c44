//! Staggered delivery of attested reports to the ledger.

use std::future::poll_fn;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::events::AttestedReport;
use crate::oracle::OracleContext;
use crate::plugin::{call_plugin, ContractTransmitter, ReportingPlugin};
use crate::schedule::transmission_delay;

pub struct Transmission<P: ReportingPlugin, T> {
    ctx: OracleContext,
    plugin: Arc<P>,
    transmitter: Arc<T>,
    inbox: mpsc::Receiver<AttestedReport<P::ReportInfo>>,
    scheduled: DelayQueue<AttestedReport<P::ReportInfo>>,
}

impl<P, T> Transmission<P, T>
where
    P: ReportingPlugin,
    T: ContractTransmitter<P::ReportInfo>,
{
    pub(crate) fn new(
        ctx: OracleContext,
        plugin: Arc<P>,
        transmitter: Arc<T>,
        inbox: mpsc::Receiver<AttestedReport<P::ReportInfo>>,
    ) -> Self {
        Transmission {
            ctx,
            plugin,
            transmitter,
            inbox,
            scheduled: DelayQueue::new(),
        }
    }

    pub async fn run(mut self) -> Result<(), ProtocolError> {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                Some(report) = self.inbox.recv() => self.on_attested(report).await?,
                Some(expired) = poll_fn(|cx| self.scheduled.poll_expired(cx)) => {
                    self.on_scheduled(expired.into_inner()).await;
                }
            }
        }
        debug!(
            "Transmission of {} stopped with {} reports pending",
            self.ctx.id,
            self.scheduled.len()
        );
        Ok(())
    }

    async fn on_attested(
        &mut self,
        attested: AttestedReport<P::ReportInfo>,
    ) -> Result<(), ProtocolError> {
        let accept = call_plugin(
            "should_accept_attested_report",
            self.ctx.local.max_duration_should_accept(),
            self.plugin
                .should_accept_attested_report(attested.seq_nr, &attested.report),
        )
        .await;
        if accept != Some(true) {
            debug!(
                "Oracle {} not accepting report {} of seq {}",
                self.ctx.id, attested.index, attested.seq_nr
            );
            return Ok(());
        }

        let config = &self.ctx.config;
        let delay = transmission_delay(
            &config.transmission_key,
            attested.seq_nr,
            attested.index,
            &config.transmission_schedule,
            config.delta_stage(),
            self.ctx.id,
        )
        .ok_or_else(|| {
            ProtocolError::Invariant(format!(
                "oracle {} missing from transmission schedule",
                self.ctx.id
            ))
        })?;
        debug!(
            "Oracle {} scheduled report {} of seq {} in {}ms",
            self.ctx.id,
            attested.index,
            attested.seq_nr,
            delay.as_millis()
        );
        self.scheduled.insert(attested, delay);
        Ok(())
    }

    async fn on_scheduled(&mut self, attested: AttestedReport<P::ReportInfo>) {
        let transmit = call_plugin(
            "should_transmit_accepted_report",
            self.ctx.local.max_duration_should_transmit(),
            self.plugin
                .should_transmit_accepted_report(attested.seq_nr, &attested.report),
        )
        .await;
        if transmit != Some(true) {
            debug!(
                "Oracle {} skipping transmission of report {} of seq {}",
                self.ctx.id, attested.index, attested.seq_nr
            );
            return;
        }

        let max_duration = self.ctx.local.max_duration_transmit();
        let result = tokio::time::timeout(
            max_duration,
            self.transmitter.transmit(
                self.ctx.config.config_digest,
                attested.seq_nr,
                &attested.report,
                &attested.signatures,
            ),
        )
        .await;
        match result {
            Ok(Ok(())) => info!(
                "Oracle {} transmitted report {} of seq {} from {}",
                self.ctx.id,
                attested.index,
                attested.seq_nr,
                self.transmitter.from_account()
            ),
            Ok(Err(e)) => warn!(
                "Oracle {} failed to transmit report {} of seq {}: {}",
                self.ctx.id, attested.index, attested.seq_nr, e
            ),
            Err(_) => warn!(
                "Oracle {} timed out transmitting report {} of seq {} after {}ms",
                self.ctx.id,
                attested.index,
                attested.seq_nr,
                max_duration.as_millis()
            ),
        }
    }
}
