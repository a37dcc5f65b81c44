//! Data handed across the reporting-plugin boundary.
//!
//! The protocol treats every payload here as opaque bytes; only the plugin
//! gives them meaning.

use serde::{Deserialize, Serialize};

use crate::types::ids::{Epoch, OracleId, SeqNr};

pub type Query = Vec<u8>;
pub type Observation = Vec<u8>;
pub type Outcome = Vec<u8>;
pub type Report = Vec<u8>;

/// Context for the round-scoped plugin calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct OutcomeContext {
    /// Sequence number of the round being computed
    pub seq_nr: SeqNr,
    /// Outcome committed at `seq_nr - 1`, empty for the first round
    pub previous_outcome: Outcome,
    pub epoch: Epoch,
    /// One-based round number within the epoch
    pub round: u64,
}

/// An observation together with the oracle that made it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributedObservation {
    pub observation: Observation,
    pub observer: OracleId,
}

/// A report plus plugin-defined metadata for the transmitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWithInfo<I> {
    pub report: Report,
    pub info: I,
}

/// Number of valid observations the leader needs before proposing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quorum {
    NMinusF,
    TwoFPlusOne,
    FPlusOne,
    Exact(usize),
}

impl Quorum {
    /// Resolve to a concrete count for an `n`-oracle, `f`-fault configuration
    pub fn size(self, n: usize, f: usize) -> usize {
        match self {
            Quorum::NMinusF => n - f,
            Quorum::TwoFPlusOne => 2 * f + 1,
            Quorum::FPlusOne => f + 1,
            Quorum::Exact(count) => count,
        }
    }

    /// Whether the quorum is attainable at all given `n` and `f`
    pub fn is_valid(self, n: usize, f: usize) -> bool {
        let size = self.size(n, f);
        size >= 1 && size <= n - f
    }
}
