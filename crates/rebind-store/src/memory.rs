//! In-memory storage backend
//!
//! Keeps the full transaction history plus a current-revision map. The
//! capabilities a `MemoryStore` advertises are chosen by a
//! [`BackendProfile`], so one implementation can stand in for a file
//! storage with an ordered index, a relational storage with a record
//! cursor, or a bare history iterator.

use crate::error::{StorageError, StorageResult};
use crate::oid::{Oid, Tid};
use crate::storage::{
    CurrentRecordIteration, FormatUpgrade, HistoryIteration, OidIndex, Record, Storage,
    Transaction, TransactionIter, TransactionMeta, TransactionRecords, CURRENT_FORMAT,
    LEGACY_FORMAT,
};
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// Capabilities advertised by a [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendProfile {
    /// Expose [`OidIndex`]
    pub ordered_index: bool,
    /// Expose [`CurrentRecordIteration`]
    pub current_iteration: bool,
    /// Expose [`HistoryIteration`]
    pub history: bool,
    /// Report undo support
    pub undo: bool,
    /// Expose [`FormatUpgrade`]
    pub format_marker: bool,
}

impl BackendProfile {
    /// File storage: ordered index, history, undo and a format marker
    pub const FILE: Self = Self {
        ordered_index: true,
        current_iteration: false,
        history: true,
        undo: true,
        format_marker: true,
    };

    /// Relational storage: record cursor, history and undo
    pub const RELATIONAL: Self = Self {
        ordered_index: false,
        current_iteration: true,
        history: true,
        undo: true,
        format_marker: false,
    };

    /// Append-only storage without undo: history only
    pub const HISTORY_ONLY: Self = Self {
        ordered_index: false,
        current_iteration: false,
        history: true,
        undo: false,
        format_marker: false,
    };

    /// History that cannot stand in for current records
    pub const UNDOABLE_HISTORY: Self = Self {
        ordered_index: false,
        current_iteration: false,
        history: true,
        undo: true,
        format_marker: false,
    };

    /// No enumeration at all
    pub const OPAQUE: Self = Self {
        ordered_index: false,
        current_iteration: false,
        history: false,
        undo: false,
        format_marker: false,
    };
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self::FILE
    }
}

#[derive(Debug)]
struct Pending {
    id: u64,
    meta: TransactionMeta,
    writes: IndexMap<Oid, Vec<u8>>,
    voted: bool,
}

#[derive(Debug)]
struct Inner {
    current: BTreeMap<Oid, (Tid, Vec<u8>)>,
    revisions: BTreeMap<Oid, BTreeSet<Tid>>,
    history: Vec<TransactionRecords>,
    last_tid: Tid,
    next_txn: u64,
    open: Option<Pending>,
    missing: BTreeSet<Oid>,
    format: [u8; 4],
}

impl Inner {
    fn new(format: [u8; 4]) -> Self {
        Self {
            current: BTreeMap::new(),
            revisions: BTreeMap::new(),
            history: Vec::new(),
            last_tid: Tid::ZERO,
            next_txn: 1,
            open: None,
            missing: BTreeSet::new(),
            format,
        }
    }

    fn pending(&mut self, txn: &Transaction) -> StorageResult<&mut Pending> {
        match self.open.as_mut() {
            Some(pending) if pending.id == txn.id() => Ok(pending),
            Some(pending) => Err(StorageError::TransactionMismatch {
                expected: pending.id,
                actual: txn.id(),
            }),
            None => Err(StorageError::NoTransaction),
        }
    }

    fn apply(&mut self, tid: Tid, meta: TransactionMeta, records: Vec<(Oid, Vec<u8>)>) {
        let mut written = Vec::with_capacity(records.len());
        for (oid, data) in records {
            self.current.insert(oid, (tid, data.clone()));
            self.revisions.entry(oid).or_default().insert(tid);
            written.push(Record::new(oid, tid, data));
        }
        self.history.push(TransactionRecords {
            tid,
            meta,
            records: written,
        });
        self.last_tid = tid;
    }
}

/// Storage held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    profile: BackendProfile,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create empty store with the file profile and a legacy format marker
    #[must_use]
    pub fn new() -> Self {
        Self::with_profile(BackendProfile::FILE)
    }

    /// Create empty store with `profile`
    #[must_use]
    pub fn with_profile(profile: BackendProfile) -> Self {
        Self {
            name: "memory".to_string(),
            profile,
            inner: RwLock::new(Inner::new(LEGACY_FORMAT)),
        }
    }

    /// Set the display name
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the format marker
    #[must_use]
    pub fn with_format(self, marker: [u8; 4]) -> Self {
        self.inner.write().format = marker;
        self
    }

    /// Capabilities of this store
    #[inline]
    #[must_use]
    pub fn profile(&self) -> BackendProfile {
        self.profile
    }

    /// Commit `records` in one transaction, outside of the two-phase API
    ///
    /// # Errors
    /// Returns error if a transaction is already open.
    pub fn commit_records(
        &self,
        meta: TransactionMeta,
        records: impl IntoIterator<Item = (Oid, Vec<u8>)>,
    ) -> StorageResult<Tid> {
        let mut inner = self.inner.write();
        if inner.open.is_some() {
            return Err(StorageError::TransactionInProgress);
        }
        let tid = inner.last_tid.next();
        inner.apply(tid, meta, records.into_iter().collect());
        Ok(tid)
    }

    /// Replay a committed transaction under its original id
    pub(crate) fn replay(&self, records: TransactionRecords) {
        let mut inner = self.inner.write();
        let pairs = records
            .records
            .into_iter()
            .map(|record| (record.oid, record.data))
            .collect();
        inner.apply(records.tid, records.meta, pairs);
    }

    /// Keep `oid` in the index but fail every load of it
    pub fn mark_missing(&self, oid: Oid) {
        self.inner.write().missing.insert(oid);
    }

    /// Number of current objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().current.len()
    }

    /// Whether the store holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().current.is_empty()
    }

    /// Number of committed transactions
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.inner.read().history.len()
    }

    /// Whether a transaction is open
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.inner.read().open.is_some()
    }

    /// Current payload of `oid`, ignoring injected corruption
    #[must_use]
    pub fn current(&self, oid: Oid) -> Option<Vec<u8>> {
        self.inner
            .read()
            .current
            .get(&oid)
            .map(|(_, data)| data.clone())
    }

    /// Committed history, oldest first
    #[must_use]
    pub fn snapshot_history(&self) -> Vec<TransactionRecords> {
        self.inner.read().history.clone()
    }

    fn read_current(inner: &Inner, oid: Oid) -> StorageResult<(Vec<u8>, Tid)> {
        if inner.missing.contains(&oid) {
            return Err(StorageError::KeyNotFound(oid));
        }
        inner
            .current
            .get(&oid)
            .map(|(tid, data)| (data.clone(), *tid))
            .ok_or(StorageError::KeyNotFound(oid))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)> {
        Self::read_current(&self.inner.read(), oid)
    }

    fn tpc_begin(&self, meta: TransactionMeta) -> StorageResult<Transaction> {
        let mut inner = self.inner.write();
        if inner.open.is_some() {
            return Err(StorageError::TransactionInProgress);
        }
        let id = inner.next_txn;
        inner.next_txn += 1;
        inner.open = Some(Pending {
            id,
            meta: meta.clone(),
            writes: IndexMap::new(),
            voted: false,
        });
        Ok(Transaction::new(id, meta))
    }

    fn store(&self, oid: Oid, serial: Tid, data: Vec<u8>, txn: &Transaction) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let known = match inner.revisions.get(&oid) {
            Some(serials) => serials.contains(&serial),
            None => serial == Tid::ZERO,
        };
        if !known {
            return Err(StorageError::Conflict {
                oid,
                serial: serial.to_string(),
            });
        }
        let pending = inner.pending(txn)?;
        pending.writes.insert(oid, data);
        Ok(())
    }

    fn tpc_vote(&self, txn: &Transaction) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.pending(txn)?.voted = true;
        Ok(())
    }

    fn tpc_finish(&self, txn: Transaction) -> StorageResult<Tid> {
        let mut inner = self.inner.write();
        if !inner.pending(&txn)?.voted {
            return Err(StorageError::NotVoted(txn.id()));
        }
        let pending = inner.open.take().ok_or(StorageError::NoTransaction)?;
        let tid = inner.last_tid.next();
        inner.apply(tid, pending.meta, pending.writes.into_iter().collect());
        tracing::debug!(store = %self.name, %tid, "transaction committed");
        Ok(tid)
    }

    fn tpc_abort(&self, txn: Transaction) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.pending(&txn)?;
        inner.open = None;
        Ok(())
    }

    fn last_transaction(&self) -> Tid {
        self.inner.read().last_tid
    }

    fn oid_index(&self) -> Option<&dyn OidIndex> {
        self.profile.ordered_index.then_some(self as &dyn OidIndex)
    }

    fn current_records(&self) -> Option<&dyn CurrentRecordIteration> {
        self.profile
            .current_iteration
            .then_some(self as &dyn CurrentRecordIteration)
    }

    fn history(&self) -> Option<&dyn HistoryIteration> {
        self.profile.history.then_some(self as &dyn HistoryIteration)
    }

    fn supports_undo(&self) -> bool {
        self.profile.undo
    }

    fn format_upgrade(&self) -> Option<&dyn FormatUpgrade> {
        self.profile
            .format_marker
            .then_some(self as &dyn FormatUpgrade)
    }
}

impl OidIndex for MemoryStore {
    fn next_oid(&self, from: Oid) -> Option<Oid> {
        self.inner.read().current.range(from..).next().map(|(oid, _)| *oid)
    }
}

impl CurrentRecordIteration for MemoryStore {
    fn record_iternext(&self, from: Oid) -> StorageResult<Option<(Record, Option<Oid>)>> {
        let inner = self.inner.read();
        let mut range = inner.current.range(from..);
        let Some((&oid, _)) = range.next() else {
            return Ok(None);
        };
        let next = range.next().map(|(oid, _)| *oid);
        let (data, serial) = Self::read_current(&inner, oid)?;
        Ok(Some((Record::new(oid, serial, data), next)))
    }
}

impl HistoryIteration for MemoryStore {
    fn transactions(&self) -> StorageResult<TransactionIter<'_>> {
        let end = self.inner.read().history.len();
        Ok(Box::new((0..end).filter_map(move |index| {
            self.inner.read().history.get(index).cloned().map(Ok)
        })))
    }
}

impl FormatUpgrade for MemoryStore {
    fn format_marker(&self) -> [u8; 4] {
        self.inner.read().format
    }

    fn upgrade_format(&self) -> StorageResult<()> {
        self.inner.write().format = CURRENT_FORMAT;
        Ok(())
    }
}
