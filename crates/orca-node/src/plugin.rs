//! Demo price feed: every oracle observes a price near a base value and the
//! cluster agrees on the median.

use orca_core::{
    AttributedObservation, Observation, Outcome, OutcomeContext, Query, Quorum, ReportWithInfo,
    SeqNr,
};
use orca_protocol::{PluginError, ReportingPlugin};
use rand::Rng;
use tracing::debug;

use crate::config::FeedConfig;

pub struct MedianPlugin {
    feed: FeedConfig,
}

impl MedianPlugin {
    pub fn new(feed: FeedConfig) -> Self {
        MedianPlugin { feed }
    }

    fn draw_price(&self) -> u64 {
        let spread = self.feed.spread.min(self.feed.base_price);
        let low = self.feed.base_price - spread;
        let high = self.feed.base_price.saturating_add(spread);
        rand::thread_rng().gen_range(low..=high)
    }
}

fn decode_price(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Median of the valid prices, the lower one for an even count
fn median(observations: &[AttributedObservation]) -> Option<u64> {
    let mut prices: Vec<u64> = observations
        .iter()
        .filter_map(|ao| decode_price(&ao.observation))
        .collect();
    if prices.is_empty() {
        return None;
    }
    prices.sort_unstable();
    Some(prices[(prices.len() - 1) / 2])
}

/// Report layout: sequence number then median, both big-endian
fn encode_report(seq_nr: SeqNr, median: u64) -> Vec<u8> {
    [seq_nr.to_be_bytes(), median.to_be_bytes()].concat()
}

impl ReportingPlugin for MedianPlugin {
    type ReportInfo = u64;

    async fn query(&self, _ctx: &OutcomeContext) -> Result<Query, PluginError> {
        Ok(Vec::new())
    }

    async fn observation(
        &self,
        ctx: &OutcomeContext,
        _query: &Query,
    ) -> Result<Observation, PluginError> {
        let price = self.draw_price();
        debug!("Observed price {} for seq {}", price, ctx.seq_nr);
        Ok(price.to_be_bytes().to_vec())
    }

    async fn validate_observation(
        &self,
        _ctx: &OutcomeContext,
        _query: &Query,
        observation: &AttributedObservation,
    ) -> Result<(), PluginError> {
        match decode_price(&observation.observation) {
            Some(price) if price > 0 => Ok(()),
            Some(_) => Err(PluginError::new("zero price")),
            None => Err(PluginError::new(format!(
                "price must be 8 bytes, got {}",
                observation.observation.len()
            ))),
        }
    }

    fn observation_quorum(&self, _ctx: &OutcomeContext, _query: &Query) -> Quorum {
        Quorum::TwoFPlusOne
    }

    async fn outcome(
        &self,
        _ctx: &OutcomeContext,
        _query: &Query,
        observations: &[AttributedObservation],
    ) -> Result<Outcome, PluginError> {
        let median = median(observations).ok_or_else(|| PluginError::new("no valid prices"))?;
        Ok(median.to_be_bytes().to_vec())
    }

    async fn reports(
        &self,
        seq_nr: SeqNr,
        outcome: &Outcome,
    ) -> Result<Vec<ReportWithInfo<u64>>, PluginError> {
        let median =
            decode_price(outcome).ok_or_else(|| PluginError::new("malformed outcome"))?;
        Ok(vec![ReportWithInfo {
            report: encode_report(seq_nr, median),
            info: median,
        }])
    }

    async fn should_accept_attested_report(
        &self,
        _seq_nr: SeqNr,
        report: &ReportWithInfo<u64>,
    ) -> Result<bool, PluginError> {
        Ok(report.info > 0)
    }

    async fn should_transmit_accepted_report(
        &self,
        _seq_nr: SeqNr,
        _report: &ReportWithInfo<u64>,
    ) -> Result<bool, PluginError> {
        Ok(true)
    }
}
