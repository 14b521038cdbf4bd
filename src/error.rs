use crate::model::{Kind, RecordId};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`crate::remote::RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// No document exists yet. Callers treat this as "create on first write".
    #[error("remote document not found")]
    NotFound,
    #[error("remote document changed since it was last read")]
    VersionConflict,
    #[error("remote rejected the credentials")]
    Unauthorized,
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("remote did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed remote document: {0}")]
    Malformed(String),
}

impl RemoteError {
    /// Transport-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_) | RemoteError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store not initialized at {} (run `tsync init`)", .0.display())]
    NotInitialized(PathBuf),
    #[error("store already initialized at {}", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no {kind} record with id {id}")]
    RecordNotFound { kind: Kind, id: RecordId },
    #[error("{kind} record with id {id} already exists")]
    DuplicateId { kind: Kind, id: RecordId },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote sync is not configured (run `tsync setup`)")]
    NotConfigured,
    #[error("device is offline")]
    Offline,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("sync failed after {attempts} attempts ({last}); data kept in the local failure backup")]
    RetriesExhausted { attempts: u32, last: RemoteError },
}
