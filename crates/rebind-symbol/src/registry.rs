//! Type registry for locating classes
//!
//! The host describes which types exist today through [`TypeRegistry`].
//! [`TypeCatalog`] is the explicit table implementation; [`OpenRegistry`]
//! treats every descriptor as present at its own location.

use crate::descriptor::ClassDescriptor;
use std::collections::{HashMap, HashSet};

/// Outcome of locating a descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeLookup {
    /// Nothing importable at that module and name
    Missing,
    /// Importable; the type reports this canonical location
    Canonical(ClassDescriptor),
    /// Importable, but the object carries no module and name of its own
    Anonymous,
}

/// Source of truth about the types that exist
pub trait TypeRegistry {
    /// Locate `descriptor`
    fn lookup(&self, descriptor: &ClassDescriptor) -> TypeLookup;
}

impl<T: TypeRegistry + ?Sized> TypeRegistry for Box<T> {
    fn lookup(&self, descriptor: &ClassDescriptor) -> TypeLookup {
        (**self).lookup(descriptor)
    }
}

impl<T: TypeRegistry + ?Sized> TypeRegistry for std::sync::Arc<T> {
    fn lookup(&self, descriptor: &ClassDescriptor) -> TypeLookup {
        (**self).lookup(descriptor)
    }
}

/// Registry that considers every type present and canonical
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenRegistry;

impl TypeRegistry for OpenRegistry {
    fn lookup(&self, descriptor: &ClassDescriptor) -> TypeLookup {
        TypeLookup::Canonical(descriptor.clone())
    }
}

/// Explicit table of known types
///
/// # Example
/// ```
/// use rebind_symbol::{ClassDescriptor, TypeCatalog, TypeLookup, TypeRegistry};
///
/// let factory = ClassDescriptor::new("module1", "Factory");
/// let renamed = ClassDescriptor::new("module1", "NewFactory");
///
/// let mut catalog = TypeCatalog::new();
/// catalog.define(renamed.clone());
/// catalog.alias(factory.clone(), renamed.clone());
///
/// assert_eq!(catalog.lookup(&factory), TypeLookup::Canonical(renamed));
/// ```
#[derive(Debug, Default, Clone)]
pub struct TypeCatalog {
    defined: HashSet<ClassDescriptor>,
    aliases: HashMap<ClassDescriptor, ClassDescriptor>,
    anonymous: HashSet<ClassDescriptor>,
}

impl TypeCatalog {
    /// Create empty catalog
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type at its canonical location
    pub fn define(&mut self, descriptor: ClassDescriptor) -> &mut Self {
        self.defined.insert(descriptor);
        self
    }

    /// Make `location` an importable alias of the type defined at `canonical`
    pub fn alias(&mut self, location: ClassDescriptor, canonical: ClassDescriptor) -> &mut Self {
        self.aliases.insert(location, canonical);
        self
    }

    /// Register an importable object without a canonical name
    pub fn anonymous(&mut self, descriptor: ClassDescriptor) -> &mut Self {
        self.anonymous.insert(descriptor);
        self
    }

    /// Forget anything importable at `descriptor`
    pub fn remove(&mut self, descriptor: &ClassDescriptor) -> &mut Self {
        self.defined.remove(descriptor);
        self.aliases.remove(descriptor);
        self.anonymous.remove(descriptor);
        self
    }

    /// Forget everything importable from `module`
    pub fn remove_module(&mut self, module: &str) -> &mut Self {
        self.defined.retain(|d| d.module() != module);
        self.aliases.retain(|d, _| d.module() != module);
        self.anonymous.retain(|d| d.module() != module);
        self
    }

    /// Number of importable locations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.defined.len() + self.aliases.len() + self.anonymous.len()
    }

    /// Whether nothing is importable
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TypeRegistry for TypeCatalog {
    fn lookup(&self, descriptor: &ClassDescriptor) -> TypeLookup {
        if self.defined.contains(descriptor) {
            TypeLookup::Canonical(descriptor.clone())
        } else if let Some(canonical) = self.aliases.get(descriptor) {
            TypeLookup::Canonical(canonical.clone())
        } else if self.anonymous.contains(descriptor) {
            TypeLookup::Anonymous
        } else {
            TypeLookup::Missing
        }
    }
}
