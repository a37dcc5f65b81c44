pub mod ids;
pub mod plugin;

pub use ids::{ConfigDigest, Epoch, OracleId, SeqNr};
pub use plugin::{
    AttributedObservation, Observation, Outcome, OutcomeContext, Query, Quorum, Report,
    ReportWithInfo,
};
