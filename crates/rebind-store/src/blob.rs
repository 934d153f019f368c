//! Pass-through wrapper for stores that keep blob payloads alongside
//!
//! Record access is forwarded to the wrapped store; enumeration
//! capabilities are not, callers reach them through [`Storage::wrapped`].

use crate::error::StorageResult;
use crate::oid::{Oid, Tid};
use crate::storage::{Storage, Transaction, TransactionMeta};
use std::path::{Path, PathBuf};

/// Storage wrapper adding a blob directory
#[derive(Debug)]
pub struct BlobStorage<S> {
    inner: S,
    blob_dir: PathBuf,
}

impl<S: Storage> BlobStorage<S> {
    /// Wrap `inner`, storing blobs under `blob_dir`
    pub fn new(inner: S, blob_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            blob_dir: blob_dir.into(),
        }
    }

    /// Blob directory
    #[must_use]
    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    /// Wrapped store
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Storage> Storage for BlobStorage<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)> {
        self.inner.load(oid)
    }

    fn tpc_begin(&self, meta: TransactionMeta) -> StorageResult<Transaction> {
        self.inner.tpc_begin(meta)
    }

    fn store(&self, oid: Oid, serial: Tid, data: Vec<u8>, txn: &Transaction) -> StorageResult<()> {
        self.inner.store(oid, serial, data, txn)
    }

    fn tpc_vote(&self, txn: &Transaction) -> StorageResult<()> {
        self.inner.tpc_vote(txn)
    }

    fn tpc_finish(&self, txn: Transaction) -> StorageResult<Tid> {
        self.inner.tpc_finish(txn)
    }

    fn tpc_abort(&self, txn: Transaction) -> StorageResult<()> {
        self.inner.tpc_abort(txn)
    }

    fn last_transaction(&self) -> Tid {
        self.inner.last_transaction()
    }

    fn wrapped(&self) -> Option<&dyn Storage> {
        Some(&self.inner)
    }
}
