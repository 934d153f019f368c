//! Placeholders for types that cannot be located

use crate::descriptor::ClassDescriptor;
use indexmap::IndexMap;
use rebind_pickle::Global;
use std::sync::Arc;

/// Stand-in for a type missing from the registry
///
/// Clones share one allocation; two placeholders for the same descriptor
/// obtained from one [`BrokenTypeRegistry`] are the same placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenType {
    descriptor: Arc<ClassDescriptor>,
}

impl BrokenType {
    /// Descriptor this placeholder stands in for
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &ClassDescriptor {
        &self.descriptor
    }

    /// Global that writes back to exactly the original descriptor
    #[must_use]
    pub fn to_global(&self) -> Global {
        Global::broken(self.descriptor.module(), self.descriptor.name())
    }

    /// Whether `self` and `other` are the same placeholder
    #[inline]
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.descriptor, &other.descriptor)
    }
}

/// Run-scoped memo of broken placeholders, keyed by dotted path
#[derive(Debug, Default, Clone)]
pub struct BrokenTypeRegistry {
    types: IndexMap<String, BrokenType>,
}

impl BrokenTypeRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder for `descriptor`, created on first request
    pub fn register(&mut self, descriptor: &ClassDescriptor) -> BrokenType {
        self.types
            .entry(descriptor.dotted())
            .or_insert_with(|| BrokenType {
                descriptor: Arc::new(descriptor.clone()),
            })
            .clone()
    }

    /// Placeholder registered under `dotted`
    #[inline]
    #[must_use]
    pub fn get(&self, dotted: &str) -> Option<&BrokenType> {
        self.types.get(dotted)
    }

    /// Placeholders in registration order
    pub fn iter(&self) -> impl Iterator<Item = &BrokenType> {
        self.types.values()
    }

    /// Number of placeholders
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no placeholder was registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
