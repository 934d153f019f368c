//! Error types for storage backends

use crate::oid::Oid;
use std::path::PathBuf;

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Index lists the oid but its data cannot be read
    #[error("missing key {0}")]
    KeyNotFound(Oid),

    /// Serial given to `store` is not a revision of the object
    #[error("conflict storing {oid}: serial {serial} is not a committed revision")]
    Conflict { oid: Oid, serial: String },

    /// `tpc_begin` while another transaction is open
    #[error("a transaction is already in progress")]
    TransactionInProgress,

    /// Transaction handle does not belong to the open transaction
    #[error("transaction {actual} is not the open transaction {expected}")]
    TransactionMismatch { expected: u64, actual: u64 },

    /// Operation requires an open transaction
    #[error("no transaction in progress")]
    NoTransaction,

    /// `tpc_finish` before `tpc_vote`
    #[error("transaction {0} was not voted")]
    NotVoted(u64),

    /// Object id text could not be parsed
    #[error("invalid oid '{0}'")]
    InvalidOid(String),

    /// Filesystem error
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted store could not be decoded
    #[error("format error: {0}")]
    Format(String),
}

impl StorageError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a missing-key error
    #[inline]
    #[must_use]
    pub fn is_key_missing(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
