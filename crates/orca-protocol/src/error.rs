use orca_core::{CoreError, OracleId};
use thiserror::Error;

/// Errors that abort an oracle instance
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to restore durable state: {0}")]
    Restore(#[source] DbError),

    #[error("Internal invariant violated: {0}")]
    Invariant(String),

    #[error("Channel to {0} closed unexpectedly")]
    ChannelClosed(&'static str),

    #[error("Failed to build verification pool: {0}")]
    VerifierPool(String),
}

/// Reasons a quorum certificate or epoch-start proof is rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    #[error("Too many signatures: have {have}, at most {max}")]
    TooManySignatures { have: usize, max: usize },

    #[error("Duplicate signature from {0}")]
    DuplicateSigner(OracleId),

    #[error("Signer {0} is out of range")]
    SignerOutOfRange(OracleId),

    #[error("Invalid signature from {0}")]
    InvalidSignature(OracleId),

    #[error("Malformed genesis certificate")]
    MalformedGenesis,

    #[error("Genesis certificate not allowed here")]
    UnexpectedGenesis,

    #[error("Highest certified timestamp does not match the proven maximum")]
    TimestampMismatch,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Storage error: {0}")]
    Storage(#[from] orca_store::StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CoreError),

    #[error("Database lock poisoned")]
    Poisoned,

    #[error("Database operation timed out")]
    Timeout,

    #[error("Database task failed: {0}")]
    Task(String),
}

impl DbError {
    /// Timeouts are assumed transient. Anything else means the store was
    /// reachable and answered with an error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DbError::Timeout)
    }
}

#[derive(Debug, Error)]
#[error("Plugin error: {0}")]
pub struct PluginError(pub String);

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        PluginError(message.into())
    }
}

#[derive(Debug, Error)]
#[error("Transmit error: {0}")]
pub struct TransmitError(pub String);

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Reasons an inbound frame is dropped before reaching a component
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] CoreError),

    #[error("{field} has length {len}, limit is {limit}")]
    TooLong {
        field: &'static str,
        len: usize,
        limit: usize,
    },
}
