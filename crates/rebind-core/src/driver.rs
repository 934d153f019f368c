//! MigrationDriver - runs the rewriter over a whole storage
//!
//! Changed records are stored under their oid and serial in batched
//! transactions. A transaction with no records, or any transaction of a
//! dry run, is aborted instead of committed.

use crate::config::{RulesConfig, RunConfig};
use crate::error::{MigrationError, MigrationResult};
use crate::records::StoreIterator;
use crate::rewriter::{Outcome, RecordRewriter};
use indexmap::IndexMap;
use rebind_store::{
    FormatUpgrade, Storage, StorageError, Transaction, TransactionMeta, LEGACY_FORMAT,
};
use rebind_symbol::{ClassDescriptor, SymbolResolver};
use serde::Serialize;

/// Note attached to every migration transaction
pub const TRANSACTION_NOTE: &str = "Updated factory references using rebind.";

/// Counters and findings of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Records read
    pub scanned: usize,
    /// Records stored with a new payload
    pub rewritten: usize,
    /// Records left alone because of the skip list
    pub skipped: usize,
    /// Changed records that could not be written back
    pub serialize_failures: usize,
    /// Records jumped because their key was missing
    pub missing_keys: usize,
    /// Transactions committed
    pub committed: usize,
    /// Transactions aborted
    pub aborted: usize,
    /// Whether the storage format marker was upgraded
    pub format_upgraded: bool,
    /// Rename rules discovered from the type registry
    pub implicit_rules: IndexMap<ClassDescriptor, ClassDescriptor>,
    /// Distinct warnings in first-seen order
    pub warnings: Vec<String>,
    /// Whether this was a dry run
    pub dry_run: bool,
}

/// Blocking inspection of a fatal error before it propagates
pub trait DiagnosticHook {
    /// Inspect `error`
    fn inspect(&mut self, error: &MigrationError);
}

impl<F: FnMut(&MigrationError)> DiagnosticHook for F {
    fn inspect(&mut self, error: &MigrationError) {
        self(error);
    }
}

/// Drives one migration run over a storage
pub struct MigrationDriver<'s> {
    storage: &'s dyn Storage,
    rewriter: RecordRewriter,
    config: RunConfig,
    hook: Option<Box<dyn DiagnosticHook + 's>>,
    open: Option<Transaction>,
    commits: usize,
}

impl std::fmt::Debug for MigrationDriver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationDriver")
            .field("storage", &self.storage.name())
            .field("config", &self.config)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl<'s> MigrationDriver<'s> {
    /// Create driver
    #[must_use]
    pub fn new(storage: &'s dyn Storage, rewriter: RecordRewriter, config: RunConfig) -> Self {
        Self {
            storage,
            rewriter,
            config,
            hook: None,
            open: None,
            commits: 0,
        }
    }

    /// Create driver from a rules file
    ///
    /// # Errors
    /// Returns error for invalid decoder or encoding rules.
    pub fn from_rules(
        storage: &'s dyn Storage,
        rules: &RulesConfig,
        config: RunConfig,
    ) -> MigrationResult<Self> {
        let resolver = SymbolResolver::new(rules.type_registry())
            .with_rules(rules.rename_rules(config.upgrade.is_some()))
            .with_skip(rules.skip_set());
        let rewriter = RecordRewriter::new(resolver, rules.decoder_registry()?, &config);
        Ok(Self::new(storage, rewriter, config))
    }

    /// Hook run on fatal errors in debug mode
    #[must_use]
    pub fn with_hook(mut self, hook: impl DiagnosticHook + 's) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Rewriter, with the rules and warnings of the run so far
    #[inline]
    #[must_use]
    pub fn rewriter(&self) -> &RecordRewriter {
        &self.rewriter
    }

    /// Consume the driver, keeping the rewriter
    #[must_use]
    pub fn into_rewriter(self) -> RecordRewriter {
        self.rewriter
    }

    /// Run the migration
    ///
    /// # Errors
    /// Returns the first fatal error; the open transaction is aborted.
    pub fn run(&mut self) -> MigrationResult<MigrationReport> {
        let mut report = MigrationReport {
            dry_run: self.config.dry_run,
            ..MigrationReport::default()
        };
        if let Err(err) = self.process(&mut report) {
            if self.config.debug {
                if let Some(hook) = self.hook.as_mut() {
                    hook.inspect(&err);
                }
            }
            if let Some(txn) = self.open.take() {
                if let Err(abort) = self.storage.tpc_abort(txn) {
                    tracing::warn!("cannot abort open transaction: {abort}");
                }
            }
            return Err(err);
        }

        report.implicit_rules = self
            .rewriter
            .implicit_rules()
            .iter()
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();
        report.warnings = self
            .rewriter
            .warnings()
            .messages()
            .map(str::to_owned)
            .collect();
        Ok(report)
    }

    fn process(&mut self, report: &mut MigrationReport) -> MigrationResult<()> {
        let mut records = StoreIterator::new(self.storage, self.config.start_at)?;
        self.begin()?;
        let mut count = 0usize;

        for record in records.by_ref() {
            let record = record?;
            report.scanned += 1;
            tracing::debug!("Processing OID {}", record.oid);

            match self.rewriter.rewrite(record.oid, &record.data)? {
                Outcome::Unchanged => continue,
                Outcome::Skipped => {
                    report.skipped += 1;
                    continue;
                }
                Outcome::SerializeFailed => {
                    report.serialize_failures += 1;
                    continue;
                }
                Outcome::Rewritten(data) => {
                    tracing::debug!("Updated OID {}", record.oid);
                    let txn = self.open.as_ref().ok_or(StorageError::NoTransaction)?;
                    self.storage.store(record.oid, record.serial, data, txn)?;
                    report.rewritten += 1;
                    count += 1;
                }
            }

            if count > self.config.batch_size {
                count = 0;
                self.finish(true, report)?;
                self.begin()?;
            }
        }

        self.finish(count != 0, report)?;
        report.missing_keys = records.missing_keys();

        if self.config.upgrade.is_some() && !self.config.dry_run {
            report.format_upgraded = self.upgrade_format()?;
        }
        Ok(())
    }

    fn begin(&mut self) -> MigrationResult<()> {
        let txn = self
            .storage
            .tpc_begin(TransactionMeta::new().with_note(TRANSACTION_NOTE))?;
        self.open = Some(txn);
        Ok(())
    }

    fn finish(&mut self, changed: bool, report: &mut MigrationReport) -> MigrationResult<()> {
        let Some(txn) = self.open.take() else {
            return Ok(());
        };
        self.commits += 1;
        if self.config.dry_run || !changed {
            tracing::info!(
                "Dry run selected or no changes, aborting transaction. (#{})",
                self.commits
            );
            self.storage.tpc_abort(txn)?;
            report.aborted += 1;
        } else {
            tracing::info!("Committing changes (#{}).", self.commits);
            self.storage.tpc_vote(&txn)?;
            let tid = self.storage.tpc_finish(txn)?;
            tracing::debug!(%tid, "transaction finished");
            report.committed += 1;
        }
        Ok(())
    }

    fn upgrade_format(&self) -> MigrationResult<bool> {
        let mut storage = self.storage;
        let target: &dyn FormatUpgrade = loop {
            if let Some(target) = storage.format_upgrade() {
                break target;
            }
            match storage.wrapped() {
                Some(inner) => storage = inner,
                None => return Ok(false),
            }
        };
        if target.format_marker() != LEGACY_FORMAT {
            return Ok(false);
        }
        target.upgrade_format()?;
        tracing::info!(storage = storage.name(), "Upgraded storage format marker");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rebind_store::{BackendProfile, MemoryStore, Oid, CURRENT_FORMAT};
    use rebind_symbol::TypeCatalog;

    const FACTORY: &[u8] = b"\x80\x03cmodule1\nFactory\nq\x00.\x80\x03}q\x01.";
    const NEW_FACTORY: &[u8] = b"\x80\x03cmodule1\nNewFactory\nq\x00.\x80\x03}q\x01.";

    fn d(text: &str) -> ClassDescriptor {
        text.parse().unwrap()
    }

    fn resolver() -> SymbolResolver {
        let mut catalog = TypeCatalog::new();
        catalog
            .define(d("module1 NewFactory"))
            .alias(d("module1 Factory"), d("module1 NewFactory"));
        SymbolResolver::new(catalog)
    }

    fn populated(records: usize) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .commit_records(
                TransactionMeta::new(),
                (0..records).map(|n| (Oid::from_u64(n as u64), FACTORY.to_vec())),
            )
            .unwrap();
        store
    }

    fn driver(store: &MemoryStore, config: RunConfig) -> MigrationDriver<'_> {
        let rewriter = RecordRewriter::new(resolver(), Default::default(), &config);
        MigrationDriver::new(store, rewriter, config)
    }

    #[test]
    fn commits_rewritten_records() {
        let store = populated(3);
        let report = driver(&store, RunConfig::new()).run().unwrap();

        assert_eq!(report.scanned, 3);
        assert_eq!(report.rewritten, 3);
        assert_eq!((report.committed, report.aborted), (1, 0));
        assert_eq!(store.current(Oid::from_u64(2)).unwrap(), NEW_FACTORY.to_vec());
        assert_eq!(store.transaction_count(), 2);
        let last = store.snapshot_history().pop().unwrap();
        assert_eq!(last.meta.description, TRANSACTION_NOTE);
        assert_eq!(
            report.implicit_rules.get(&d("module1 Factory")),
            Some(&d("module1 NewFactory"))
        );
    }

    #[test]
    fn batches_commit_after_threshold() {
        let store = populated(5);
        let report = driver(&store, RunConfig::new().with_batch_size(2))
            .run()
            .unwrap();
        // three stores exceed a batch of two; the remaining two form the last
        assert_eq!((report.committed, report.aborted), (2, 0));
        assert_eq!(store.transaction_count(), 3);
    }

    #[test]
    fn exact_batch_leaves_empty_final_transaction() {
        let store = populated(3);
        let report = driver(&store, RunConfig::new().with_batch_size(2))
            .run()
            .unwrap();
        assert_eq!((report.committed, report.aborted), (1, 1));
    }

    #[test]
    fn dry_run_aborts() {
        let store = populated(2);
        let report = driver(&store, RunConfig::new().with_dry_run(true))
            .run()
            .unwrap();
        assert!(report.dry_run);
        assert_eq!(report.rewritten, 2);
        assert_eq!((report.committed, report.aborted), (0, 1));
        assert_eq!(store.current(Oid::ZERO).unwrap(), FACTORY.to_vec());
        assert_eq!(report.implicit_rules.len(), 1);
    }

    #[test]
    fn no_changes_means_no_transaction() {
        let store = MemoryStore::new();
        store
            .commit_records(TransactionMeta::new(), vec![(Oid::ZERO, NEW_FACTORY.to_vec())])
            .unwrap();
        let report = driver(&store, RunConfig::new()).run().unwrap();
        assert_eq!((report.committed, report.aborted), (0, 1));
        assert_eq!(store.transaction_count(), 1);
        assert!(!store.in_transaction());
    }

    #[test]
    fn fatal_error_runs_hook_and_aborts() {
        let store = populated(1);
        store
            .commit_records(TransactionMeta::new(), vec![(Oid::from_u64(1), b"\x80\x03K".to_vec())])
            .unwrap();
        let mut seen = Vec::new();
        let result = {
            let mut driver = driver(&store, RunConfig::new().with_debug(true))
                .with_hook(|err: &MigrationError| seen.push(err.to_string()));
            driver.run()
        };
        assert!(matches!(result, Err(MigrationError::Malformed { .. })));
        assert_eq!(seen.len(), 1);
        assert!(!store.in_transaction());
        assert_eq!(store.current(Oid::ZERO).unwrap(), FACTORY.to_vec());
    }

    #[test]
    fn hook_is_ignored_without_debug() {
        let store = MemoryStore::new();
        store
            .commit_records(TransactionMeta::new(), vec![(Oid::ZERO, b"\x80\x03K".to_vec())])
            .unwrap();
        let mut calls = 0;
        let result = driver(&store, RunConfig::new())
            .with_hook(|_: &MigrationError| calls += 1)
            .run();
        assert!(result.is_err());
        assert_eq!(calls, 0);
    }

    #[test]
    fn upgrade_rewrites_format_marker() {
        let store = populated(1);
        let config = RunConfig::new().with_upgrade(crate::upgrade::UpgradeSettings::new());
        let report = driver(&store, config).run().unwrap();
        assert!(report.format_upgraded);
        assert_eq!(store.format_marker(), CURRENT_FORMAT);
    }

    #[test]
    fn dry_upgrade_keeps_format_marker() {
        let store = populated(1);
        let config = RunConfig::new()
            .with_dry_run(true)
            .with_upgrade(crate::upgrade::UpgradeSettings::new());
        let report = driver(&store, config).run().unwrap();
        assert!(!report.format_upgraded);
        assert_eq!(store.format_marker(), LEGACY_FORMAT);
    }

    #[test]
    fn unsupported_backend_fails_at_startup() {
        let store = MemoryStore::with_profile(BackendProfile::OPAQUE);
        let err = driver(&store, RunConfig::new()).run().unwrap_err();
        assert!(err.is_startup());
    }

    #[test]
    fn explicit_rules_from_file() {
        let store = populated(1);
        let rules = RulesConfig {
            renames: IndexMap::from([(d("module1 Factory"), d("module2 OtherFactory"))]),
            ..RulesConfig::default()
        };
        let mut driver = MigrationDriver::from_rules(&store, &rules, RunConfig::new()).unwrap();
        let report = driver.run().unwrap();
        assert_eq!(report.rewritten, 1);
        assert!(report.implicit_rules.is_empty());
        assert_eq!(
            store.current(Oid::ZERO).unwrap(),
            b"\x80\x03cmodule2\nOtherFactory\nq\x00.\x80\x03}q\x01.".to_vec()
        );
    }
}
