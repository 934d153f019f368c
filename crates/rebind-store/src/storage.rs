//! Storage interface
//!
//! The migration only needs a narrow slice of a storage engine: load one
//! object, and a two-phase transaction to store replacements. Enumeration
//! is offered through optional capabilities so each backend exposes the
//! cheapest way it has to walk its current records.

use crate::error::StorageResult;
use crate::oid::{Oid, Tid};
use serde::{Deserialize, Serialize};

/// Current revision of one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Object id
    pub oid: Oid,
    /// Transaction that wrote this revision
    pub serial: Tid,
    /// Two concatenated pickles: class metadata, then state
    pub data: Vec<u8>,
}

impl Record {
    /// Create record
    #[inline]
    #[must_use]
    pub fn new(oid: Oid, serial: Tid, data: Vec<u8>) -> Self {
        Self { oid, serial, data }
    }
}

/// Descriptive metadata attached to a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    /// User name
    #[serde(default)]
    pub user: String,
    /// Free-form description
    #[serde(default)]
    pub description: String,
}

impl TransactionMeta {
    /// Create empty metadata
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line to the description
    #[must_use]
    pub fn with_note(mut self, note: &str) -> Self {
        if !self.description.is_empty() {
            self.description.push('\n');
        }
        self.description.push_str(note);
        self
    }
}

/// Handle of an open transaction
///
/// Created by [`Storage::tpc_begin`] and consumed by finish or abort.
#[derive(Debug, PartialEq, Eq)]
pub struct Transaction {
    id: u64,
    meta: TransactionMeta,
}

impl Transaction {
    /// Create handle; called by backends from `tpc_begin`
    #[inline]
    #[must_use]
    pub fn new(id: u64, meta: TransactionMeta) -> Self {
        Self { id, meta }
    }

    /// Backend-assigned id
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Metadata given at begin
    #[inline]
    #[must_use]
    pub fn meta(&self) -> &TransactionMeta {
        &self.meta
    }
}

/// Records written by one committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecords {
    /// Transaction id
    pub tid: Tid,
    /// Metadata
    pub meta: TransactionMeta,
    /// Records in store order
    pub records: Vec<Record>,
}

/// Object store with two-phase commit
///
/// Methods take `&self`; backends serialize access internally so that
/// enumeration and writes can interleave.
pub trait Storage {
    /// Human readable backend name
    fn name(&self) -> &str;

    /// Current data and serial of `oid`
    ///
    /// # Errors
    /// [`crate::StorageError::KeyNotFound`] if the object cannot be read.
    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)>;

    /// Open a transaction
    ///
    /// # Errors
    /// Returns error if a transaction is already open.
    fn tpc_begin(&self, meta: TransactionMeta) -> StorageResult<Transaction>;

    /// Stage a new revision of `oid`, based on revision `serial`
    ///
    /// # Errors
    /// Returns error on serial conflict or foreign transaction.
    fn store(&self, oid: Oid, serial: Tid, data: Vec<u8>, txn: &Transaction) -> StorageResult<()>;

    /// First commit phase
    ///
    /// # Errors
    /// Returns error if the transaction cannot be committed.
    fn tpc_vote(&self, txn: &Transaction) -> StorageResult<()>;

    /// Second commit phase, returns the new transaction id
    ///
    /// # Errors
    /// Returns error if the transaction was not voted.
    fn tpc_finish(&self, txn: Transaction) -> StorageResult<Tid>;

    /// Discard everything staged in `txn`
    ///
    /// # Errors
    /// Returns error for a foreign transaction.
    fn tpc_abort(&self, txn: Transaction) -> StorageResult<()>;

    /// Id of the most recent committed transaction
    fn last_transaction(&self) -> Tid;

    /// Ordered index over current object ids
    fn oid_index(&self) -> Option<&dyn OidIndex> {
        None
    }

    /// Cursor over current records
    fn current_records(&self) -> Option<&dyn CurrentRecordIteration> {
        None
    }

    /// Iteration over every committed transaction
    fn history(&self) -> Option<&dyn HistoryIteration> {
        None
    }

    /// Whether committed transactions can be undone
    fn supports_undo(&self) -> bool {
        false
    }

    /// Storage this one wraps, if it is a pass-through wrapper
    fn wrapped(&self) -> Option<&dyn Storage> {
        None
    }

    /// On-disk format marker
    fn format_upgrade(&self) -> Option<&dyn FormatUpgrade> {
        None
    }
}

/// Ordered lookup over current object ids
pub trait OidIndex {
    /// Smallest indexed oid greater than or equal to `from`
    fn next_oid(&self, from: Oid) -> Option<Oid>;
}

/// Cursor-style iteration over current records
pub trait CurrentRecordIteration {
    /// Record at or after `from`, with the oid to continue from
    ///
    /// Returns `None` when no record remains.
    ///
    /// # Errors
    /// Returns error if the record cannot be read.
    fn record_iternext(&self, from: Oid) -> StorageResult<Option<(Record, Option<Oid>)>>;
}

/// Transactions produced one at a time
pub type TransactionIter<'a> = Box<dyn Iterator<Item = StorageResult<TransactionRecords>> + 'a>;

/// Iteration over every committed transaction, oldest first
pub trait HistoryIteration {
    /// Transactions with their records, read as the iterator advances
    ///
    /// Transactions committed after this call are not yielded.
    ///
    /// # Errors
    /// Returns error if the history cannot be read.
    fn transactions(&self) -> StorageResult<TransactionIter<'_>>;
}

/// Marker identifying the storage file format
pub trait FormatUpgrade {
    /// Current marker
    fn format_marker(&self) -> [u8; 4];

    /// Rewrite the marker to [`CURRENT_FORMAT`]
    ///
    /// # Errors
    /// Returns error if the marker cannot be written.
    fn upgrade_format(&self) -> StorageResult<()>;
}

/// Marker of stores written by Python 2 pickles
pub const LEGACY_FORMAT: [u8; 4] = *b"FS21";

/// Marker of stores written by Python 3 pickles
pub const CURRENT_FORMAT: [u8; 4] = *b"FS30";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_appends_lines() {
        let meta = TransactionMeta::new()
            .with_note("first")
            .with_note("second");
        assert_eq!(meta.description, "first\nsecond");
    }

    #[test]
    fn transaction_accessors() {
        let txn = Transaction::new(7, TransactionMeta::new().with_note("n"));
        assert_eq!(txn.id(), 7);
        assert_eq!(txn.meta().description, "n");
    }
}
