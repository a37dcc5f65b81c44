//! Orca Protocol - Byzantine fault tolerant oracle consensus
//!
//! This crate lets N oracles, up to F of them Byzantine, agree on a sequence
//! of outcomes, attest the reports derived from them and hand those reports
//! to a ledger. Each oracle runs four components connected by channels:
//! the pacemaker, outcome generation, report attestation and transmission.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod keyring;
pub mod messages;
#[cfg(any(test, feature = "test-util"))]
pub mod mocks;
pub mod network;
pub mod oracle;
pub mod outcome_generation;
pub mod pacemaker;
pub mod plugin;
pub mod pool;
pub mod qc;
pub mod report_attestation;
pub mod schedule;
pub mod signed_data;
pub mod timer;
pub mod transmission;

pub use config::{AttestationWindow, LocalConfig, OracleIdentity, SharedConfig};
pub use db::{Database, KvDatabase, PacemakerState};
pub use error::{
    CertificateError, DbError, KeyringError, MessageError, PluginError, ProtocolError,
    TransmitError,
};
pub use events::{AttestedReport, AttributedOnchainSignature};
pub use keyring::{Ed25519OnchainKeyring, OffchainKeyring, OnchainKeyring, OnchainPublicKey};
pub use messages::Message;
pub use network::{InMemoryEndpoint, InMemoryNetwork, Inbox, LinkFilter, NetworkEndpoint};
pub use oracle::{run_oracle, OracleArgs};
pub use plugin::{ContractTransmitter, ReportingPlugin};
pub use qc::{CertifiedCommit, CertifiedPrepare, CertifiedPrepareOrCommit, EpochStartProof};
