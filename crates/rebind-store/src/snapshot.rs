//! JSON snapshot storage
//!
//! A whole store persisted as one JSON document: the format marker, the
//! last transaction id and every committed transaction with hex-encoded
//! payloads. Current records are rebuilt by replaying the transactions.
//! The document is rewritten after every commit and format upgrade.

use crate::error::{StorageError, StorageResult};
use crate::memory::{BackendProfile, MemoryStore};
use crate::oid::{Oid, Tid};
use crate::storage::{
    FormatUpgrade, HistoryIteration, OidIndex, Record, Storage, Transaction, TransactionMeta,
    TransactionRecords, LEGACY_FORMAT,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Serialized form of a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Format marker, e.g. `FS21`
    pub format: String,
    /// Most recent transaction id
    pub last_transaction: Tid,
    /// Committed transactions, oldest first
    #[serde(default)]
    pub transactions: Vec<SnapshotTransaction>,
}

/// One committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTransaction {
    /// Transaction id
    pub tid: Tid,
    /// Metadata
    #[serde(flatten)]
    pub meta: TransactionMeta,
    /// Records written
    pub records: Vec<SnapshotRecord>,
}

/// One record, payload hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Object id
    pub oid: Oid,
    /// Hex payload
    pub data: String,
}

impl Snapshot {
    /// Empty snapshot with the legacy format marker
    #[must_use]
    pub fn empty() -> Self {
        Self {
            format: String::from_utf8_lossy(&LEGACY_FORMAT).into_owned(),
            last_transaction: Tid::ZERO,
            transactions: Vec::new(),
        }
    }

    /// Format marker as bytes
    ///
    /// # Errors
    /// Returns [`StorageError::Format`] unless the marker is 4 bytes.
    pub fn marker(&self) -> StorageResult<[u8; 4]> {
        <[u8; 4]>::try_from(self.format.as_bytes())
            .map_err(|_| StorageError::Format(format!("bad format marker '{}'", self.format)))
    }

    /// Build a memory store from this snapshot
    ///
    /// # Errors
    /// Returns [`StorageError::Format`] for bad markers or hex payloads.
    pub fn into_store(self, profile: BackendProfile) -> StorageResult<MemoryStore> {
        let store = MemoryStore::with_profile(profile).with_format(self.marker()?);
        for txn in self.transactions {
            let records = txn
                .records
                .into_iter()
                .map(|record| {
                    let data = hex::decode(&record.data).map_err(|err| {
                        StorageError::Format(format!("record {}: {err}", record.oid))
                    })?;
                    Ok(Record::new(record.oid, txn.tid, data))
                })
                .collect::<StorageResult<Vec<_>>>()?;
            store.replay(TransactionRecords {
                tid: txn.tid,
                meta: txn.meta,
                records,
            });
        }
        Ok(store)
    }

    /// Capture the full history of `store`
    #[must_use]
    pub fn capture(store: &MemoryStore) -> Self {
        let format = store
            .format_upgrade()
            .map_or(LEGACY_FORMAT, |upgrade| upgrade.format_marker());
        Self {
            format: String::from_utf8_lossy(&format).into_owned(),
            last_transaction: store.last_transaction(),
            transactions: store
                .snapshot_history()
                .into_iter()
                .map(|txn| SnapshotTransaction {
                    tid: txn.tid,
                    meta: txn.meta,
                    records: txn
                        .records
                        .into_iter()
                        .map(|record| SnapshotRecord {
                            oid: record.oid,
                            data: hex::encode(record.data),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Storage backed by a JSON snapshot file
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    store: MemoryStore,
}

impl SnapshotStore {
    /// Open `path`, starting empty if it does not exist
    ///
    /// # Errors
    /// Returns error if the file cannot be read or decoded.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let text =
                fs::read_to_string(&path).map_err(|err| StorageError::io_error(&path, err))?;
            serde_json::from_str(&text).map_err(|err| StorageError::Format(err.to_string()))?
        } else {
            Snapshot::empty()
        };
        let store = snapshot
            .into_store(BackendProfile::FILE)?
            .named(path.display().to_string());
        tracing::debug!(path = %path.display(), objects = store.len(), "snapshot opened");
        Ok(Self { path, store })
    }

    /// Create a snapshot file holding `store`'s history
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn create(path: impl AsRef<Path>, store: MemoryStore) -> StorageResult<Self> {
        let this = Self {
            path: path.as_ref().to_path_buf(),
            store,
        };
        this.save()?;
        Ok(this)
    }

    /// Snapshot file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backing memory store
    #[must_use]
    pub fn memory(&self) -> &MemoryStore {
        &self.store
    }

    /// Write the snapshot through a temporary file
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn save(&self) -> StorageResult<()> {
        let snapshot = Snapshot::capture(&self.store);
        let text = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| StorageError::Format(err.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text).map_err(|err| StorageError::io_error(&tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| StorageError::io_error(&self.path, err))
    }
}

impl Storage for SnapshotStore {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)> {
        self.store.load(oid)
    }

    fn tpc_begin(&self, meta: TransactionMeta) -> StorageResult<Transaction> {
        self.store.tpc_begin(meta)
    }

    fn store(&self, oid: Oid, serial: Tid, data: Vec<u8>, txn: &Transaction) -> StorageResult<()> {
        self.store.store(oid, serial, data, txn)
    }

    fn tpc_vote(&self, txn: &Transaction) -> StorageResult<()> {
        self.store.tpc_vote(txn)
    }

    fn tpc_finish(&self, txn: Transaction) -> StorageResult<Tid> {
        let tid = self.store.tpc_finish(txn)?;
        self.save()?;
        Ok(tid)
    }

    fn tpc_abort(&self, txn: Transaction) -> StorageResult<()> {
        self.store.tpc_abort(txn)
    }

    fn last_transaction(&self) -> Tid {
        self.store.last_transaction()
    }

    fn oid_index(&self) -> Option<&dyn OidIndex> {
        self.store.oid_index()
    }

    fn history(&self) -> Option<&dyn HistoryIteration> {
        self.store.history()
    }

    fn supports_undo(&self) -> bool {
        self.store.supports_undo()
    }

    fn format_upgrade(&self) -> Option<&dyn FormatUpgrade> {
        Some(self)
    }
}

impl FormatUpgrade for SnapshotStore {
    fn format_marker(&self) -> [u8; 4] {
        self.store
            .format_upgrade()
            .map_or(LEGACY_FORMAT, |upgrade| upgrade.format_marker())
    }

    fn upgrade_format(&self) -> StorageResult<()> {
        if let Some(upgrade) = self.store.format_upgrade() {
            upgrade.upgrade_format()?;
        }
        self.save()
    }
}
