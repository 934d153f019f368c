//! Persistent references
//!
//! Records point at each other through persistent ids. The migration never
//! follows them; it only has to read every shape a store may contain,
//! rename the class descriptors embedded in them and write the same shape
//! back.
//!
//! | shape            | persistent id                   |
//! |------------------|---------------------------------|
//! | `Oid`            | `oid`                           |
//! | `Typed`          | `(oid, class)`                  |
//! | `WeakBare`       | `[oid]`                         |
//! | `Weak`           | `['w', (oid,)]`                 |
//! | `WeakDatabase`   | `['w', (oid, database)]`        |
//! | `Multi`          | `['m', (database, oid, class)]` |
//! | `MultiUntyped`   | `['n', (database, oid)]`        |
//!
//! `class` is a class global, a `(module, name)` pair of strings, or `None`.

use crate::error::{MigrationError, MigrationResult};
use rebind_pickle::{Heap, Object, Protocol, Value};
use rebind_symbol::ClassDescriptor;

/// Class part of a typed reference
#[derive(Debug, Clone, PartialEq)]
pub enum ClassRef {
    /// `None`
    Absent,
    /// Class global, already resolved while loading
    Global(Value),
    /// `(module, name)` pair; `legacy` when written as protocol 2 strings
    Pair {
        /// Referenced class
        descriptor: ClassDescriptor,
        /// Whether the strings were protocol 2 strings
        legacy: bool,
    },
}

impl ClassRef {
    fn parse(value: Value) -> MigrationResult<Self> {
        match value {
            Value::None => Ok(Self::Absent),
            global @ Value::Global(_) => Ok(Self::Global(global)),
            Value::Tuple(items) => match items.as_slice() {
                [module, name] => match (module, name) {
                    (Value::Str(module), Value::Str(name)) => Ok(Self::Pair {
                        descriptor: ClassDescriptor::new(module.as_str(), name.as_str()),
                        legacy: false,
                    }),
                    (Value::LegacyString(module), Value::LegacyString(name)) => Ok(Self::Pair {
                        descriptor: ClassDescriptor::new(
                            String::from_utf8_lossy(module),
                            String::from_utf8_lossy(name),
                        ),
                        legacy: true,
                    }),
                    _ => Err(unknown("class pair of mixed kinds")),
                },
                _ => Err(unknown("class tuple")),
            },
            other => Err(unknown(other.kind())),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Self::Absent => Value::None,
            Self::Global(global) => global,
            Self::Pair { descriptor, legacy } => {
                let text = |part: &str| {
                    if legacy {
                        Value::LegacyString(part.as_bytes().to_vec())
                    } else {
                        Value::str(part)
                    }
                };
                Value::Tuple(vec![text(descriptor.module()), text(descriptor.name())])
            }
        }
    }

    /// Rename a `(module, name)` pair; returns whether it changed
    fn rename(&mut self, rename: &mut dyn FnMut(&ClassDescriptor) -> Option<ClassDescriptor>) -> bool {
        if let Self::Pair { descriptor, .. } = self {
            if let Some(target) = rename(descriptor) {
                *descriptor = target;
                return true;
            }
        }
        false
    }
}

/// One persistent reference, in the shape it was read in
#[derive(Debug, Clone, PartialEq)]
pub enum PersistentReference {
    /// Bare object id
    Oid {
        /// Object id
        oid: Value,
    },
    /// `(oid, class)`
    Typed {
        /// Object id
        oid: Value,
        /// Class hint
        class: ClassRef,
    },
    /// `[oid]`
    WeakBare {
        /// Object id
        oid: Value,
    },
    /// `['w', (oid,)]`
    Weak {
        /// Object id
        oid: Value,
    },
    /// `['w', (oid, database)]`
    WeakDatabase {
        /// Object id
        oid: Value,
        /// Database name
        database: Value,
    },
    /// `['m', (database, oid, class)]`
    Multi {
        /// Database name
        database: Value,
        /// Object id
        oid: Value,
        /// Class hint
        class: ClassRef,
    },
    /// `['n', (database, oid)]`
    MultiUntyped {
        /// Database name
        database: Value,
        /// Object id
        oid: Value,
    },
}

fn unknown(what: &str) -> MigrationError {
    MigrationError::UnknownReferenceShape(what.to_string())
}

fn oid_value(value: &Value) -> MigrationResult<Value> {
    match value {
        Value::Str(_) | Value::Bytes(_) | Value::LegacyString(_) => Ok(value.clone()),
        other => Err(unknown(&format!("object id of kind {}", other.kind()))),
    }
}

impl PersistentReference {
    /// Recognize the shape of `pid`
    ///
    /// # Errors
    /// [`MigrationError::UnknownReferenceShape`] for anything not in the
    /// table above.
    pub fn parse(pid: Value, heap: &Heap) -> MigrationResult<Self> {
        match pid {
            Value::Str(_) | Value::Bytes(_) | Value::LegacyString(_) => Ok(Self::Oid { oid: pid }),
            Value::Tuple(items) => {
                let mut items = items.into_iter();
                match (items.next(), items.next(), items.next()) {
                    (Some(oid), Some(class), None) => Ok(Self::Typed {
                        oid: oid_value(&oid)?,
                        class: ClassRef::parse(class)?,
                    }),
                    _ => Err(unknown("tuple")),
                }
            }
            Value::Ref(id) => match heap.get(id) {
                Some(Object::List(items)) => Self::parse_list(items),
                Some(_) => Err(unknown("object")),
                None => Err(unknown("dangling object")),
            },
            other => Err(unknown(other.kind())),
        }
    }

    fn parse_list(items: &[Value]) -> MigrationResult<Self> {
        let (mode, info) = match items {
            [oid] => return Ok(Self::WeakBare { oid: oid_value(oid)? }),
            [mode, Value::Tuple(info)] => (mode, info.as_slice()),
            _ => return Err(unknown("list")),
        };
        if mode.is_text("w") {
            match info {
                [oid] => Ok(Self::Weak { oid: oid_value(oid)? }),
                [oid, database] => Ok(Self::WeakDatabase {
                    oid: oid_value(oid)?,
                    database: database.clone(),
                }),
                _ => Err(unknown("weak reference")),
            }
        } else if mode.is_text("m") {
            match info {
                [database, oid, class] => Ok(Self::Multi {
                    database: database.clone(),
                    oid: oid_value(oid)?,
                    class: ClassRef::parse(class.clone())?,
                }),
                _ => Err(unknown("multi-database reference")),
            }
        } else if mode.is_text("n") {
            match info {
                [database, oid] => Ok(Self::MultiUntyped {
                    database: database.clone(),
                    oid: oid_value(oid)?,
                }),
                _ => Err(unknown("untyped multi-database reference")),
            }
        } else {
            Err(unknown("list with unknown mode"))
        }
    }

    /// Object id as read
    #[must_use]
    pub fn oid(&self) -> &Value {
        match self {
            Self::Oid { oid }
            | Self::Typed { oid, .. }
            | Self::WeakBare { oid }
            | Self::Weak { oid }
            | Self::WeakDatabase { oid, .. }
            | Self::Multi { oid, .. }
            | Self::MultiUntyped { oid, .. } => oid,
        }
    }

    fn oid_mut(&mut self) -> &mut Value {
        match self {
            Self::Oid { oid }
            | Self::Typed { oid, .. }
            | Self::WeakBare { oid }
            | Self::Weak { oid }
            | Self::WeakDatabase { oid, .. }
            | Self::Multi { oid, .. }
            | Self::MultiUntyped { oid, .. } => oid,
        }
    }

    /// Class hint, if the shape carries one
    #[must_use]
    pub fn class(&self) -> Option<&ClassRef> {
        match self {
            Self::Typed { class, .. } | Self::Multi { class, .. } => Some(class),
            _ => None,
        }
    }

    /// Persistent id value in the original shape
    ///
    /// List shapes are allocated as new lists in `heap`.
    pub fn into_pid(self, heap: &mut Heap) -> Value {
        let mode = |tag: &str| Value::str(tag);
        let mut list = |items: Vec<Value>| Value::Ref(heap.alloc(Object::List(items)));
        match self {
            Self::Oid { oid } => oid,
            Self::Typed { oid, class } => Value::Tuple(vec![oid, class.into_value()]),
            Self::WeakBare { oid } => list(vec![oid]),
            Self::Weak { oid } => list(vec![mode("w"), Value::Tuple(vec![oid])]),
            Self::WeakDatabase { oid, database } => {
                list(vec![mode("w"), Value::Tuple(vec![oid, database])])
            }
            Self::Multi {
                database,
                oid,
                class,
            } => list(vec![
                mode("m"),
                Value::Tuple(vec![database, oid, class.into_value()]),
            ]),
            Self::MultiUntyped { database, oid } => {
                list(vec![mode("n"), Value::Tuple(vec![database, oid])])
            }
        }
    }
}

/// Rewrites persistent references while a record is loaded
#[derive(Debug, Clone, Copy)]
pub struct ReferenceInterceptor {
    normalize_oids: bool,
    protocol: Protocol,
}

impl ReferenceInterceptor {
    /// Interceptor that keeps object ids in their original encoding
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Self {
            normalize_oids: false,
            protocol,
        }
    }

    /// Re-tag every object id as raw bytes
    #[must_use]
    pub fn normalizing_oids(mut self) -> Self {
        self.normalize_oids = true;
        self
    }

    /// Parse `pid`, rename its class pair and wrap it for writing
    ///
    /// `rename` returns the new descriptor for a class pair that must
    /// change. The second element of the result tells whether anything
    /// was renamed.
    ///
    /// # Errors
    /// [`MigrationError::UnknownReferenceShape`] for unknown shapes.
    pub fn intercept(
        &self,
        pid: Value,
        heap: &mut Heap,
        rename: &mut dyn FnMut(&ClassDescriptor) -> Option<ClassDescriptor>,
    ) -> MigrationResult<(Value, bool)> {
        let mut reference = PersistentReference::parse(pid, heap)?;
        let renamed = match &mut reference {
            PersistentReference::Typed { class, .. } | PersistentReference::Multi { class, .. } => {
                class.rename(rename)
            }
            _ => false,
        };
        if self.normalize_oids {
            let oid = reference.oid_mut();
            if let Some(bytes) = oid.string_bytes().map(<[u8]>::to_vec) {
                *oid = if self.protocol.version() >= 3 {
                    Value::Bytes(bytes)
                } else {
                    Value::LegacyString(bytes)
                };
            }
        }
        Ok((Value::Persistent(Box::new(reference.into_pid(heap))), renamed))
    }
}
