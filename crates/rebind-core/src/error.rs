//! Error types for the migration engine
//!
//! Recoverable conditions (missing types, unreadable records, records that
//! cannot be written back) never surface here; they are logged and
//! counted. Everything in [`MigrationError`] stops the run.

use rebind_pickle::DecodeError;
use rebind_store::{Oid, StorageError};
use std::path::PathBuf;

/// Fatal migration error
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Storage offers no way to enumerate its current records
    #[error("don't know how to iterate through storage '{0}'")]
    UnsupportedBackend(String),

    /// Neither the primary encoding nor any fallback could decode a value
    #[error(
        "cannot decode attribute \"{attribute}\": encoding={encoding}, fallback_encodings={fallbacks:?}"
    )]
    DecodeExhausted {
        /// Attribute being decoded
        attribute: String,
        /// Primary encoding
        encoding: String,
        /// Fallback encodings tried in order
        fallbacks: Vec<String>,
    },

    /// Record payload could not be parsed
    #[error("malformed record {oid}: {source}")]
    Malformed {
        /// Record id
        oid: Oid,
        /// Parser error
        #[source]
        source: DecodeError,
    },

    /// First pickle of a record is not a class reference
    #[error("unknown class metadata format in record {oid}: {kind}")]
    UnknownClassMetadata {
        /// Record id
        oid: Oid,
        /// Kind of value found
        kind: &'static str,
    },

    /// Persistent id with no known shape
    #[error("unknown persistent reference format: {0}")]
    UnknownReferenceShape(String),

    /// Storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid rules or run configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Rules file could not be read or written
    #[error("io error on {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

impl MigrationError {
    /// Create configuration error
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this is an exhausted attribute decode
    #[inline]
    #[must_use]
    pub fn is_fatal_decode(&self) -> bool {
        matches!(self, Self::DecodeExhausted { .. })
    }

    /// Whether the error was raised before any record was read
    #[inline]
    #[must_use]
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedBackend(_) | Self::Config(_) | Self::Io { .. }
        )
    }

    /// Map a parser error for record `oid`
    ///
    /// Errors raised by load hooks are unwrapped back to the migration
    /// error they carry.
    pub(crate) fn from_decode(oid: Oid, error: DecodeError) -> Self {
        match error {
            DecodeError::Hook(hook) => match hook.downcast::<MigrationError>() {
                Ok(inner) => *inner,
                Err(other) => Self::Malformed {
                    oid,
                    source: DecodeError::Hook(other),
                },
            },
            source => Self::Malformed { oid, source },
        }
    }
}

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_exhausted_display() {
        let err = MigrationError::DecodeExhausted {
            attribute: "text".into(),
            encoding: "ascii".into(),
            fallbacks: vec!["utf-8".into()],
        };
        assert_eq!(
            err.to_string(),
            "cannot decode attribute \"text\": encoding=ascii, fallback_encodings=[\"utf-8\"]"
        );
        assert!(err.is_fatal_decode());
        assert!(!err.is_startup());
    }

    #[test]
    fn hook_error_is_unwrapped() {
        let hook: rebind_pickle::HookError =
            Box::new(MigrationError::UnknownReferenceShape("int".into()));
        let err = MigrationError::from_decode(Oid::ZERO, DecodeError::Hook(hook));
        assert!(matches!(err, MigrationError::UnknownReferenceShape(_)));
    }

    #[test]
    fn parser_error_is_malformed() {
        let err = MigrationError::from_decode(Oid::from_u64(2), DecodeError::Truncated { offset: 4 });
        assert!(matches!(err, MigrationError::Malformed { oid, .. } if oid == Oid::from_u64(2)));
        assert!(err.to_string().starts_with("malformed record 0x02"));
    }

    #[test]
    fn startup_errors() {
        assert!(MigrationError::UnsupportedBackend("memory".into()).is_startup());
        assert!(MigrationError::config("bad").is_startup());
    }
}
