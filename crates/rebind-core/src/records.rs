//! StoreIterator - enumerates the current records of a storage
//!
//! Wrappers are unwrapped first, then the cheapest strategy the backend
//! offers is picked:
//!
//! 1. ordered oid index, tolerating records whose key is missing
//! 2. current-record cursor
//! 3. full history, only when the backend cannot undo
//!
//! Anything else is [`MigrationError::UnsupportedBackend`].

use crate::error::{MigrationError, MigrationResult};
use rebind_store::{
    CurrentRecordIteration, Oid, OidIndex, Record, Storage, StorageError, TransactionIter,
};
use std::fmt;

/// Way records are enumerated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStrategy {
    /// Ordered oid index
    OidIndex,
    /// Current-record cursor
    Cursor,
    /// Every committed transaction
    History,
}

impl fmt::Display for IterationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OidIndex => "oid-index",
            Self::Cursor => "cursor",
            Self::History => "history",
        })
    }
}

enum State<'s> {
    Index {
        index: &'s dyn OidIndex,
        next: Option<Oid>,
    },
    Cursor {
        cursor: &'s dyn CurrentRecordIteration,
        next: Option<Oid>,
    },
    History {
        transactions: TransactionIter<'s>,
        records: std::vec::IntoIter<Record>,
        start_at: Oid,
    },
    Done,
}

/// Iterator over `(oid, serial, payload)` records from a resume point
pub struct StoreIterator<'s> {
    storage: &'s dyn Storage,
    state: State<'s>,
    strategy: IterationStrategy,
    missing_keys: usize,
}

impl fmt::Debug for StoreIterator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreIterator")
            .field("storage", &self.storage.name())
            .field("strategy", &self.strategy)
            .field("missing_keys", &self.missing_keys)
            .finish_non_exhaustive()
    }
}

impl<'s> StoreIterator<'s> {
    /// Start enumerating `storage` at `start_at`
    ///
    /// # Errors
    /// [`MigrationError::UnsupportedBackend`] if the storage offers no
    /// usable enumeration; storage errors while reading history.
    pub fn new(storage: &'s dyn Storage, start_at: Oid) -> MigrationResult<Self> {
        let mut storage = storage;
        while let Some(inner) = storage.wrapped() {
            storage = inner;
        }

        let (strategy, state) = if let Some(index) = storage.oid_index() {
            let next = index.next_oid(start_at);
            (IterationStrategy::OidIndex, State::Index { index, next })
        } else if let Some(cursor) = storage.current_records() {
            (
                IterationStrategy::Cursor,
                State::Cursor {
                    cursor,
                    next: Some(start_at),
                },
            )
        } else if let (Some(history), false) = (storage.history(), storage.supports_undo()) {
            (
                IterationStrategy::History,
                State::History {
                    transactions: history.transactions()?,
                    records: Vec::new().into_iter(),
                    start_at,
                },
            )
        } else {
            return Err(MigrationError::UnsupportedBackend(storage.name().to_string()));
        };

        tracing::debug!(storage = storage.name(), %strategy, start = %start_at, "iterating records");
        Ok(Self {
            storage,
            state,
            strategy,
            missing_keys: 0,
        })
    }

    /// Strategy in use
    #[inline]
    #[must_use]
    pub fn strategy(&self) -> IterationStrategy {
        self.strategy
    }

    /// Records jumped because their key was missing
    #[inline]
    #[must_use]
    pub fn missing_keys(&self) -> usize {
        self.missing_keys
    }

    fn jump(&mut self, oid: Oid, err: &StorageError) {
        tracing::error!("Jumping record {oid}, referencing missing key in database: {err}");
        self.missing_keys += 1;
    }
}

impl Iterator for StoreIterator<'_> {
    type Item = MigrationResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match &mut self.state {
                State::Index { index, next } => {
                    let oid = (*next)?;
                    *next = oid.next().and_then(|from| index.next_oid(from));
                    match self.storage.load(oid) {
                        Ok((data, serial)) => return Some(Ok(Record::new(oid, serial, data))),
                        Err(err) if err.is_key_missing() => self.jump(oid, &err),
                        Err(err) => {
                            self.state = State::Done;
                            return Some(Err(err.into()));
                        }
                    }
                }
                State::Cursor { cursor, next } => {
                    let from = (*next)?;
                    match cursor.record_iternext(from) {
                        Ok(Some((record, following))) => {
                            *next = following;
                            return Some(Ok(record));
                        }
                        Ok(None) => {
                            self.state = State::Done;
                            return None;
                        }
                        Err(StorageError::KeyNotFound(oid)) => {
                            *next = oid.next();
                            self.jump(oid, &StorageError::KeyNotFound(oid));
                        }
                        Err(err) => {
                            self.state = State::Done;
                            return Some(Err(err.into()));
                        }
                    }
                }
                State::History {
                    transactions,
                    records,
                    start_at,
                } => {
                    if let Some(record) = records.find(|record| record.oid >= *start_at) {
                        return Some(Ok(record));
                    }
                    match transactions.next() {
                        Some(Ok(txn)) => *records = txn.records.into_iter(),
                        Some(Err(err)) => {
                            self.state = State::Done;
                            return Some(Err(err.into()));
                        }
                        None => {
                            self.state = State::Done;
                            return None;
                        }
                    }
                }
                State::Done => return None,
            }
        }
    }
}
