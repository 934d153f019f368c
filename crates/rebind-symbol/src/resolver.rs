//! SymbolResolver - decides where each class descriptor points now
//!
//! Resolution order for a descriptor:
//! 1. skip-listed: left alone, the caller decides whether to skip the record
//! 2. explicit rename rule
//! 3. implicit rule discovered earlier in the run
//! 4. registry lookup: missing types become broken, moved types produce a
//!    new implicit rule, everything else is unchanged

use crate::descriptor::ClassDescriptor;
use crate::registry::{TypeLookup, TypeRegistry};
use crate::warnings::WarningLog;
use indexmap::{IndexMap, IndexSet};

/// Result of resolving one descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Descriptor is on the skip list
    Skipped,
    /// Descriptor must be rewritten to the target
    Renamed(ClassDescriptor),
    /// Descriptor is already canonical
    Unchanged,
    /// Descriptor cannot be located
    Broken(ClassDescriptor),
}

impl Resolution {
    /// Whether applying this resolution changes the record
    #[inline]
    #[must_use]
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Renamed(_))
    }
}

/// Ordered `source -> target` rename table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenameRules {
    rules: IndexMap<ClassDescriptor, ClassDescriptor>,
}

impl RenameRules {
    /// Create empty table
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a rule
    pub fn insert(&mut self, from: ClassDescriptor, to: ClassDescriptor) -> Option<ClassDescriptor> {
        self.rules.insert(from, to)
    }

    /// Builder form of [`Self::insert`]
    #[must_use]
    pub fn with(mut self, from: ClassDescriptor, to: ClassDescriptor) -> Self {
        self.rules.insert(from, to);
        self
    }

    /// Target for `from`
    #[inline]
    #[must_use]
    pub fn get(&self, from: &ClassDescriptor) -> Option<&ClassDescriptor> {
        self.rules.get(from)
    }

    /// Add every rule of `other`, replacing existing sources
    pub fn merge(&mut self, other: &RenameRules) {
        for (from, to) in &other.rules {
            self.rules.insert(from.clone(), to.clone());
        }
    }

    /// Rules in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&ClassDescriptor, &ClassDescriptor)> {
        self.rules.iter()
    }

    /// Number of rules
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl FromIterator<(ClassDescriptor, ClassDescriptor)> for RenameRules {
    fn from_iter<I: IntoIterator<Item = (ClassDescriptor, ClassDescriptor)>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

/// Descriptors whose records are never rewritten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipSet {
    entries: IndexSet<ClassDescriptor>,
}

impl SkipSet {
    /// Blob records carry their payload outside the pickle
    pub const BLOB: (&'static str, &'static str) = ("ZODB.blob", "Blob");

    /// Skip set with no entries
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: IndexSet::new(),
        }
    }

    /// Add an entry
    #[must_use]
    pub fn with(mut self, descriptor: ClassDescriptor) -> Self {
        self.entries.insert(descriptor);
        self
    }

    /// Add an entry in place
    pub fn insert(&mut self, descriptor: ClassDescriptor) -> bool {
        self.entries.insert(descriptor)
    }

    /// Whether `descriptor` is skipped
    #[inline]
    #[must_use]
    pub fn contains(&self, descriptor: &ClassDescriptor) -> bool {
        self.entries.contains(descriptor)
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &ClassDescriptor> {
        self.entries.iter()
    }
}

impl Default for SkipSet {
    fn default() -> Self {
        Self::empty().with(ClassDescriptor::new(Self::BLOB.0, Self::BLOB.1))
    }
}

/// Run-scoped resolver owning the discovered implicit rules
pub struct SymbolResolver {
    registry: Box<dyn TypeRegistry>,
    explicit: RenameRules,
    implicit: RenameRules,
    skip: SkipSet,
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("explicit", &self.explicit)
            .field("implicit", &self.implicit)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}

impl SymbolResolver {
    /// Create resolver over `registry` with the default skip set
    #[must_use]
    pub fn new(registry: impl TypeRegistry + 'static) -> Self {
        Self {
            registry: Box::new(registry),
            explicit: RenameRules::new(),
            implicit: RenameRules::new(),
            skip: SkipSet::default(),
        }
    }

    /// Use `rules` as the explicit rename table
    #[must_use]
    pub fn with_rules(mut self, rules: RenameRules) -> Self {
        self.explicit = rules;
        self
    }

    /// Replace the skip set
    #[must_use]
    pub fn with_skip(mut self, skip: SkipSet) -> Self {
        self.skip = skip;
        self
    }

    /// Resolve one descriptor
    ///
    /// Missing types are reported once per run through `warnings`.
    pub fn resolve(&mut self, descriptor: &ClassDescriptor, warnings: &mut WarningLog) -> Resolution {
        if self.skip.contains(descriptor) {
            return Resolution::Skipped;
        }
        if let Some(target) = self.explicit.get(descriptor) {
            return Resolution::Renamed(target.clone());
        }
        if let Some(target) = self.implicit.get(descriptor) {
            return Resolution::Renamed(target.clone());
        }

        match self.registry.lookup(descriptor) {
            TypeLookup::Missing => {
                warnings.warn(format!("Missing factory for {descriptor}"));
                Resolution::Broken(descriptor.clone())
            }
            TypeLookup::Canonical(canonical) if canonical != *descriptor => {
                tracing::info!("New implicit rule detected {descriptor} to {canonical}");
                self.implicit.insert(descriptor.clone(), canonical.clone());
                Resolution::Renamed(canonical)
            }
            TypeLookup::Canonical(_) | TypeLookup::Anonymous => Resolution::Unchanged,
        }
    }

    /// Whether `descriptor` is on the skip list
    #[inline]
    #[must_use]
    pub fn is_skipped(&self, descriptor: &ClassDescriptor) -> bool {
        self.skip.contains(descriptor)
    }

    /// Rules discovered from the registry during this run
    #[inline]
    #[must_use]
    pub fn implicit_rules(&self) -> &RenameRules {
        &self.implicit
    }

    /// Rules supplied by configuration
    #[inline]
    #[must_use]
    pub fn explicit_rules(&self) -> &RenameRules {
        &self.explicit
    }

    /// Union of the selected tables; implicit entries come last
    #[must_use]
    pub fn rules(&self, implicit: bool, explicit: bool) -> RenameRules {
        let mut rules = RenameRules::new();
        if explicit {
            rules.merge(&self.explicit);
        }
        if implicit {
            rules.merge(&self.implicit);
        }
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TypeCatalog;

    fn d(text: &str) -> ClassDescriptor {
        text.parse().unwrap()
    }

    fn catalog() -> TypeCatalog {
        let mut catalog = TypeCatalog::new();
        catalog
            .define(d("module1 NewFactory"))
            .alias(d("module1 Factory"), d("module1 NewFactory"))
            .define(d("module2 OtherFactory"))
            .anonymous(d("module1 Anonymous"));
        catalog
    }

    #[test]
    fn implicit_rule_recorded_once() {
        let mut resolver = SymbolResolver::new(catalog());
        let mut warnings = WarningLog::new();

        let first = resolver.resolve(&d("module1 Factory"), &mut warnings);
        let second = resolver.resolve(&d("module1 Factory"), &mut warnings);
        assert_eq!(first, Resolution::Renamed(d("module1 NewFactory")));
        assert_eq!(second, first);
        assert_eq!(resolver.implicit_rules().len(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn explicit_overrides_implicit() {
        let rules = RenameRules::new().with(d("module1 Factory"), d("module2 OtherFactory"));
        let mut resolver = SymbolResolver::new(catalog()).with_rules(rules);
        let mut warnings = WarningLog::new();

        assert_eq!(
            resolver.resolve(&d("module1 Factory"), &mut warnings),
            Resolution::Renamed(d("module2 OtherFactory"))
        );
        assert!(resolver.implicit_rules().is_empty());
    }

    #[test]
    fn missing_type_is_broken_and_warned_once() {
        let mut resolver = SymbolResolver::new(catalog());
        let mut warnings = WarningLog::new();

        for _ in 0..3 {
            assert_eq!(
                resolver.resolve(&d("module1 Data"), &mut warnings),
                Resolution::Broken(d("module1 Data"))
            );
        }
        assert_eq!(
            warnings.messages().collect::<Vec<_>>(),
            vec!["Missing factory for module1 Data"]
        );
    }

    #[test]
    fn anonymous_and_canonical_are_unchanged() {
        let mut resolver = SymbolResolver::new(catalog());
        let mut warnings = WarningLog::new();
        assert_eq!(
            resolver.resolve(&d("module1 Anonymous"), &mut warnings),
            Resolution::Unchanged
        );
        assert_eq!(
            resolver.resolve(&d("module2 OtherFactory"), &mut warnings),
            Resolution::Unchanged
        );
    }

    #[test]
    fn skip_list_wins_over_rules() {
        let rules = RenameRules::new().with(d("ZODB.blob Blob"), d("other Blob"));
        let mut resolver = SymbolResolver::new(catalog()).with_rules(rules);
        let mut warnings = WarningLog::new();
        assert_eq!(
            resolver.resolve(&d("ZODB.blob Blob"), &mut warnings),
            Resolution::Skipped
        );
        assert!(resolver.is_skipped(&d("ZODB.blob Blob")));
    }

    #[test]
    fn rules_union() {
        let rules = RenameRules::new().with(d("a A"), d("b B"));
        let mut resolver = SymbolResolver::new(catalog()).with_rules(rules);
        resolver.resolve(&d("module1 Factory"), &mut WarningLog::new());

        assert_eq!(resolver.rules(true, false).len(), 1);
        assert_eq!(resolver.rules(false, true).len(), 1);
        assert_eq!(resolver.rules(true, true).len(), 2);
    }
}
