//! rebind storage
//!
//! The narrow storage interface the migration drives, plus the backends
//! shipped with the workspace:
//!
//! - [`MemoryStore`]: in-memory store with selectable capability profiles
//! - [`SnapshotStore`]: JSON file snapshot used by the command line tool
//! - [`BlobStorage`]: pass-through wrapper
//!
//! # Example
//!
//! ```rust
//! use rebind_store::{MemoryStore, Oid, Storage, TransactionMeta};
//!
//! let store = MemoryStore::new();
//! store
//!     .commit_records(TransactionMeta::new(), vec![(Oid::ZERO, b"root".to_vec())])
//!     .unwrap();
//!
//! let (data, serial) = store.load(Oid::ZERO).unwrap();
//! let txn = store.tpc_begin(TransactionMeta::new()).unwrap();
//! store.store(Oid::ZERO, serial, data, &txn).unwrap();
//! store.tpc_abort(txn).unwrap();
//! ```

#![warn(missing_docs)]

pub mod blob;
pub mod error;
pub mod memory;
pub mod oid;
pub mod snapshot;
pub mod storage;

// Re-exports
pub use blob::BlobStorage;
pub use error::{StorageError, StorageResult};
pub use memory::{BackendProfile, MemoryStore};
pub use oid::{Oid, Tid};
pub use snapshot::{Snapshot, SnapshotStore};
pub use storage::{
    CurrentRecordIteration, FormatUpgrade, HistoryIteration, OidIndex, Record, Storage,
    Transaction, TransactionIter, TransactionMeta, TransactionRecords, CURRENT_FORMAT, LEGACY_FORMAT,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
