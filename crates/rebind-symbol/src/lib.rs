//! rebind symbol resolution
//!
//! Decides, for every class descriptor found in a record, whether it is
//! already canonical, renamed by rule, moved, missing, or skipped.
//!
//! # Overview
//!
//! - **ClassDescriptor**: `(module, name)` pair with a `"module name"` text form
//! - **TypeRegistry**: host-provided knowledge about which types exist
//! - **SymbolResolver**: explicit rules, discovered implicit rules and skip list
//! - **BrokenTypeRegistry**: memoized placeholders for missing types
//! - **WarningLog**: once-per-run warnings
//!
//! # Example
//!
//! ```rust
//! use rebind_symbol::{ClassDescriptor, Resolution, SymbolResolver, TypeCatalog, WarningLog};
//!
//! let mut catalog = TypeCatalog::new();
//! catalog.define(ClassDescriptor::new("module1", "NewFactory"));
//! catalog.alias(
//!     ClassDescriptor::new("module1", "Factory"),
//!     ClassDescriptor::new("module1", "NewFactory"),
//! );
//!
//! let mut resolver = SymbolResolver::new(catalog);
//! let mut warnings = WarningLog::new();
//! let resolution = resolver.resolve(&ClassDescriptor::new("module1", "Factory"), &mut warnings);
//! assert_eq!(resolution, Resolution::Renamed(ClassDescriptor::new("module1", "NewFactory")));
//! ```

#![warn(missing_docs)]

pub mod broken;
pub mod descriptor;
pub mod registry;
pub mod resolver;
pub mod warnings;

// Re-exports
pub use broken::{BrokenType, BrokenTypeRegistry};
pub use descriptor::{ClassDescriptor, DescriptorError};
pub use registry::{OpenRegistry, TypeCatalog, TypeLookup, TypeRegistry};
pub use resolver::{RenameRules, Resolution, SkipSet, SymbolResolver};
pub use warnings::WarningLog;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for symbol resolution
    pub use crate::{
        BrokenTypeRegistry, ClassDescriptor, RenameRules, Resolution, SkipSet, SymbolResolver,
        TypeCatalog, TypeLookup, TypeRegistry, WarningLog,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
