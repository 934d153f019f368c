//! rebind core - class-reference migration engine
//!
//! Walks every current record of a storage and rewrites the class
//! references inside it:
//! - Resolves class globals through explicit rules and the type registry
//! - Rewrites class pairs inside persistent references
//! - Runs attribute decoders registered for the record's class
//! - Optionally upgrades protocol 2 records for Python 3 hosts
//! - Stores changed records in batched transactions
//!
//! # Example
//!
//! ```rust
//! use rebind_core::prelude::*;
//! use rebind_store::{MemoryStore, Oid, TransactionMeta};
//!
//! let store = MemoryStore::new();
//! store.commit_records(
//!     TransactionMeta::new(),
//!     vec![(Oid::ZERO, b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01.".to_vec())],
//! )?;
//!
//! let rules = RulesConfig::from_toml_str(
//!     r#"
//!     [renames]
//!     "module1 Factory" = "module2 OtherFactory"
//!     "#,
//! )?;
//! let mut driver = MigrationDriver::from_rules(&store, &rules, RunConfig::new())?;
//! let report = driver.run()?;
//! assert_eq!(report.rewritten, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

pub mod config;
pub mod decode;
pub mod driver;
pub mod error;
pub mod records;
pub mod reference;
pub mod rewriter;
pub mod upgrade;

// Re-exports for convenience
pub use config::{save_renames, RulesConfig, RunConfig, TypesConfig, DEFAULT_BATCH_SIZE};
pub use decode::{
    decode_with_fallbacks, DecodeAttribute, Decoder, DecoderRegistry, EncodeBinary, TextEncoding,
};
pub use driver::{DiagnosticHook, MigrationDriver, MigrationReport, TRANSACTION_NOTE};
pub use error::{MigrationError, MigrationResult};
pub use records::{IterationStrategy, StoreIterator};
pub use reference::{ClassRef, PersistentReference, ReferenceInterceptor};
pub use rewriter::{Outcome, RecordRewriter};
pub use upgrade::{default_renames, fix_datetime_arguments, UpgradeSettings};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for running a migration
    pub use crate::{
        DecoderRegistry, MigrationDriver, MigrationError, MigrationReport, MigrationResult,
        Outcome, RecordRewriter, RulesConfig, RunConfig, TextEncoding, UpgradeSettings,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
