use std::sync::{Arc, Mutex};
use std::time::Duration;

use orca_core::serialize::{from_bytes, to_bytes};
use orca_core::{ConfigDigest, Epoch};
use orca_store::Storage;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::DbError;
use crate::qc::CertifiedPrepareOrCommit;

/// Durable pacemaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacemakerState {
    pub epoch: Epoch,
    pub highest_sent_new_epoch_wish: Epoch,
}

/// Durable store for the state that protects against equivocation after
/// a restart. Writes must be atomic per key.
pub trait Database: Send + Sync + 'static {
    fn read_state(&self, config_digest: ConfigDigest) -> Result<Option<PacemakerState>, DbError>;

    fn write_state(&self, config_digest: ConfigDigest, state: &PacemakerState)
        -> Result<(), DbError>;

    fn read_cert(
        &self,
        config_digest: ConfigDigest,
    ) -> Result<Option<CertifiedPrepareOrCommit>, DbError>;

    fn write_cert(
        &self,
        config_digest: ConfigDigest,
        cert: &CertifiedPrepareOrCommit,
    ) -> Result<(), DbError>;
}

const STATE_PREFIX: &[u8] = b"pacemaker/";
const CERT_PREFIX: &[u8] = b"cert/";

/// `Database` over a byte-level storage backend
pub struct KvDatabase<S: Storage> {
    storage: Mutex<S>,
}

impl<S: Storage> KvDatabase<S> {
    pub fn new(storage: S) -> Self {
        KvDatabase {
            storage: Mutex::new(storage),
        }
    }

    fn key(prefix: &[u8], config_digest: ConfigDigest) -> Vec<u8> {
        let mut key = prefix.to_vec();
        key.extend_from_slice(config_digest.as_bytes());
        key
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let storage = self.storage.lock().map_err(|_| DbError::Poisoned)?;
        Ok(storage.get(key))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        let mut storage = self.storage.lock().map_err(|_| DbError::Poisoned)?;
        storage.put(key, value);
        if let Err(e) = storage.commit() {
            storage.rollback();
            return Err(e.into());
        }
        Ok(())
    }
}

impl<S: Storage + 'static> Database for KvDatabase<S> {
    fn read_state(&self, config_digest: ConfigDigest) -> Result<Option<PacemakerState>, DbError> {
        self.get(&Self::key(STATE_PREFIX, config_digest))?
            .map(|bytes| from_bytes(&bytes).map_err(DbError::from))
            .transpose()
    }

    fn write_state(
        &self,
        config_digest: ConfigDigest,
        state: &PacemakerState,
    ) -> Result<(), DbError> {
        self.put(&Self::key(STATE_PREFIX, config_digest), &to_bytes(state)?)
    }

    fn read_cert(
        &self,
        config_digest: ConfigDigest,
    ) -> Result<Option<CertifiedPrepareOrCommit>, DbError> {
        self.get(&Self::key(CERT_PREFIX, config_digest))?
            .map(|bytes| from_bytes(&bytes).map_err(DbError::from))
            .transpose()
    }

    fn write_cert(
        &self,
        config_digest: ConfigDigest,
        cert: &CertifiedPrepareOrCommit,
    ) -> Result<(), DbError> {
        self.put(&Self::key(CERT_PREFIX, config_digest), &to_bytes(cert)?)
    }
}

/// Run a blocking database call off the event loop, bounded by `timeout`
pub(crate) async fn with_timeout<T, F>(
    db: &Arc<dyn Database>,
    timeout: Duration,
    call: F,
) -> Result<T, DbError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Database) -> Result<T, DbError> + Send + 'static,
{
    let db = Arc::clone(db);
    let task = tokio::task::spawn_blocking(move || call(db.as_ref()));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(DbError::Task(e.to_string())),
        Err(_) => Err(DbError::Timeout),
    }
}

/// Read durable state at startup.
///
/// Timeouts are retried with backoff until cancelled; any other error is
/// returned. `None` means the instance was cancelled first.
pub(crate) async fn restore<T, F>(
    db: &Arc<dyn Database>,
    timeout: Duration,
    backoff: Duration,
    cancel: &CancellationToken,
    what: &'static str,
    read: F,
) -> Result<Option<T>, DbError>
where
    T: Send + 'static,
    F: Fn(&dyn Database) -> Result<T, DbError> + Clone + Send + 'static,
{
    let mut delay = backoff;
    loop {
        match with_timeout(db, timeout, read.clone()).await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if e.is_timeout() => {
                warn!("Timed out reading {}, retrying in {}ms", what, delay.as_millis());
            }
            Err(e) => return Err(e),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(backoff * 32);
    }
}
