//! Attribute decoders
//!
//! A decoder rewrites one attribute of a record whose state is a mapping.
//! Decoders are registered per class descriptor and run in registration
//! order against the descriptor the record ends up with after renaming.

use crate::error::{MigrationError, MigrationResult};
use indexmap::IndexMap;
use rebind_pickle::{dict_get_mut, Value};
use rebind_symbol::{ClassDescriptor, WarningLog};
use std::fmt;
use std::str::FromStr;

/// Text encodings understood by [`DecodeAttribute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextEncoding {
    /// 7-bit ASCII
    Ascii,
    /// UTF-8
    Utf8,
    /// ISO-8859-1
    Latin1,
    /// Windows-1252
    Cp1252,
}

/// Windows-1252 code points for bytes `0x80..=0x9F`; zero marks an
/// undefined byte
const CP1252_HIGH: [u16; 32] = [
    0x20AC, 0, 0x201A, 0x0192, 0x201E, 0x2026, 0x2020, 0x2021, 0x02C6, 0x2030, 0x0160, 0x2039,
    0x0152, 0, 0x017D, 0, 0, 0x2018, 0x2019, 0x201C, 0x201D, 0x2022, 0x2013, 0x2014, 0x02DC,
    0x2122, 0x0161, 0x203A, 0x0153, 0, 0x017E, 0x0178,
];

impl TextEncoding {
    /// Canonical label
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Ascii => "ascii",
            Self::Utf8 => "utf-8",
            Self::Latin1 => "latin-1",
            Self::Cp1252 => "cp1252",
        }
    }

    /// Decode `bytes` strictly, `None` if any byte is invalid
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Ascii => bytes
                .is_ascii()
                .then(|| bytes.iter().map(|&b| char::from(b)).collect()),
            Self::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            Self::Latin1 => Some(bytes.iter().map(|&b| char::from(b)).collect()),
            Self::Cp1252 => bytes
                .iter()
                .map(|&b| match b {
                    0x80..=0x9F => match CP1252_HIGH[usize::from(b - 0x80)] {
                        0 => None,
                        code => char::from_u32(u32::from(code)),
                    },
                    _ => Some(char::from(b)),
                })
                .collect(),
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TextEncoding {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ascii" | "us-ascii" => Ok(Self::Ascii),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Self::Latin1),
            "cp1252" | "windows-1252" => Ok(Self::Cp1252),
            _ => Err(MigrationError::config(format!("unknown encoding '{s}'"))),
        }
    }
}

/// Decode `bytes` with `encoding`, then each fallback in turn
///
/// A fallback success is reported once per encoding and attribute pair.
///
/// # Errors
/// [`MigrationError::DecodeExhausted`] if no encoding accepts the bytes.
pub fn decode_with_fallbacks(
    bytes: &[u8],
    attribute: &str,
    encoding: TextEncoding,
    fallbacks: &[TextEncoding],
    warnings: &mut WarningLog,
) -> MigrationResult<String> {
    if let Some(text) = encoding.decode(bytes) {
        return Ok(text);
    }
    for fallback in fallbacks {
        if let Some(text) = fallback.decode(bytes) {
            warnings.warn(format!(
                "Encoding fallback to \"{fallback}\" while decoding attribute \"{attribute}\""
            ));
            tracing::debug!(?bytes, %text, "decoded with fallback");
            return Ok(text);
        }
    }
    Err(MigrationError::DecodeExhausted {
        attribute: attribute.to_string(),
        encoding: encoding.to_string(),
        fallbacks: fallbacks.iter().map(ToString::to_string).collect(),
    })
}

/// Transformation of a mapping state
pub trait Decoder: fmt::Debug {
    /// Apply to `state`, returning whether it changed
    ///
    /// # Errors
    /// Returns error if the value cannot be transformed.
    fn apply(&self, state: &mut [(Value, Value)], warnings: &mut WarningLog)
        -> MigrationResult<bool>;
}

/// Turn a raw string attribute into text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeAttribute {
    attribute: String,
    encoding: TextEncoding,
    fallbacks: Vec<TextEncoding>,
}

impl DecodeAttribute {
    /// Decode `attribute` with `encoding`
    #[must_use]
    pub fn new(attribute: impl Into<String>, encoding: TextEncoding) -> Self {
        Self {
            attribute: attribute.into(),
            encoding,
            fallbacks: Vec::new(),
        }
    }

    /// Encodings to try when the primary one fails
    #[must_use]
    pub fn with_fallbacks(mut self, fallbacks: Vec<TextEncoding>) -> Self {
        self.fallbacks = fallbacks;
        self
    }
}

impl Decoder for DecodeAttribute {
    fn apply(
        &self,
        state: &mut [(Value, Value)],
        warnings: &mut WarningLog,
    ) -> MigrationResult<bool> {
        let Some(value) = dict_get_mut(state, &self.attribute) else {
            return Ok(false);
        };
        let bytes = match value {
            Value::Bytes(bytes) | Value::LegacyString(bytes) => bytes,
            _ => return Ok(false),
        };
        let text = decode_with_fallbacks(
            bytes,
            &self.attribute,
            self.encoding,
            &self.fallbacks,
            warnings,
        )?;
        *value = Value::Str(text);
        Ok(true)
    }
}

/// Turn a string attribute into raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeBinary {
    attribute: String,
}

impl EncodeBinary {
    /// Encode `attribute`
    #[must_use]
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl Decoder for EncodeBinary {
    fn apply(
        &self,
        state: &mut [(Value, Value)],
        _warnings: &mut WarningLog,
    ) -> MigrationResult<bool> {
        let Some(value) = dict_get_mut(state, &self.attribute) else {
            return Ok(false);
        };
        let bytes = match value {
            Value::Str(text) => text.as_bytes().to_vec(),
            Value::LegacyString(bytes) => std::mem::take(bytes),
            _ => return Ok(false),
        };
        *value = Value::Bytes(bytes);
        Ok(true)
    }
}

/// Decoders keyed by class descriptor
#[derive(Debug, Default)]
pub struct DecoderRegistry {
    decoders: IndexMap<ClassDescriptor, Vec<Box<dyn Decoder>>>,
}

impl DecoderRegistry {
    /// Create empty registry
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoder for `descriptor`
    pub fn register(&mut self, descriptor: ClassDescriptor, decoder: impl Decoder + 'static) {
        self.decoders
            .entry(descriptor)
            .or_default()
            .push(Box::new(decoder));
    }

    /// Builder form of [`Self::register`]
    #[must_use]
    pub fn with(mut self, descriptor: ClassDescriptor, decoder: impl Decoder + 'static) -> Self {
        self.register(descriptor, decoder);
        self
    }

    /// Decoders for `descriptor`, in registration order
    #[must_use]
    pub fn decoders_for(&self, descriptor: &ClassDescriptor) -> &[Box<dyn Decoder>] {
        self.decoders.get(descriptor).map_or(&[], Vec::as_slice)
    }

    /// Run every decoder for `descriptor` against `state`
    ///
    /// # Errors
    /// Returns the first decoder error.
    pub fn apply(
        &self,
        descriptor: &ClassDescriptor,
        state: &mut [(Value, Value)],
        warnings: &mut WarningLog,
    ) -> MigrationResult<bool> {
        let mut changed = false;
        for decoder in self.decoders_for(descriptor) {
            changed |= decoder.apply(state, warnings)?;
        }
        Ok(changed)
    }

    /// Number of descriptors with decoders
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    /// Whether no decoder is registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}
