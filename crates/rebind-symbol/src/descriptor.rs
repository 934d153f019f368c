//! ClassDescriptor - module and name of a persisted type
//!
//! Provides [`ClassDescriptor`], the `(module, name)` pair that pickles use
//! to refer to classes.

use rebind_pickle::Global;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Identifier of a type by module and name
///
/// The text form used in rule files and log lines separates the two parts
/// with a single space: `"module1.interfaces IFactory"`.
///
/// # Example
/// ```
/// use rebind_symbol::ClassDescriptor;
///
/// let descriptor: ClassDescriptor = "module1 Factory".parse().unwrap();
/// assert_eq!(descriptor.module(), "module1");
/// assert_eq!(descriptor.dotted(), "module1.Factory");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassDescriptor {
    module: String,
    name: String,
}

/// Errors parsing a descriptor from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DescriptorError {
    /// Input was blank
    #[error("empty class descriptor")]
    Empty,

    /// Input did not have exactly two space separated parts
    #[error("class descriptor must be 'module name', got '{0}'")]
    Arity(String),
}

impl ClassDescriptor {
    /// Create descriptor
    #[inline]
    #[must_use]
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }

    /// Module part
    #[inline]
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Name part
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `module.name`
    #[inline]
    #[must_use]
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    /// Descriptor of a pickle global
    #[inline]
    #[must_use]
    pub fn of_global(global: &Global) -> Self {
        Self::new(global.module(), global.name())
    }

    /// Resolved pickle global for this descriptor
    #[inline]
    #[must_use]
    pub fn to_global(&self) -> Global {
        Global::new(self.module.clone(), self.name.clone())
    }

    /// Whether `global` names this descriptor
    #[inline]
    #[must_use]
    pub fn matches(&self, global: &Global) -> bool {
        global.is(&self.module, &self.name)
    }
}

impl Display for ClassDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.module, self.name)
    }
}

impl FromStr for ClassDescriptor {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (None, _, _) => Err(DescriptorError::Empty),
            (Some(module), Some(name), None) => Ok(Self::new(module, name)),
            _ => Err(DescriptorError::Arity(s.to_string())),
        }
    }
}

impl From<&Global> for ClassDescriptor {
    fn from(global: &Global) -> Self {
        Self::of_global(global)
    }
}

impl Serialize for ClassDescriptor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClassDescriptor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
