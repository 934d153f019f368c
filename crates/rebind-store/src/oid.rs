//! Object and transaction identifiers
//!
//! Both are 8 big-endian bytes. Object ids print in the short `0x..` form
//! used by log lines and `--oid`; transaction ids print all 16 hex digits.

use crate::error::StorageError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Persistent object identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid([u8; 8]);

impl Oid {
    /// Object id `0x00`, the root object
    pub const ZERO: Self = Self([0; 8]);

    /// Create from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create from integer
    #[inline]
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// Create from a byte slice of length 8
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 8]>::try_from(bytes).ok().map(Self)
    }

    /// Integer value
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Raw bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Following oid, `None` at the end of the id space
    #[inline]
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.as_u64().checked_add(1).map(Self::from_u64)
    }

    /// Short hex form: leading zero bytes stripped, at least one byte kept
    #[must_use]
    pub fn repr(self) -> String {
        let hex = hex::encode(self.0);
        let trimmed = hex.trim_start_matches('0');
        if trimmed.is_empty() {
            "0x00".to_string()
        } else if trimmed.len() % 2 == 1 {
            format!("0x0{trimmed}")
        } else {
            format!("0x{trimmed}")
        }
    }

    /// Parse the `0x..` form
    ///
    /// # Errors
    /// Returns [`StorageError::InvalidOid`] for non-hex input or values
    /// wider than 8 bytes.
    pub fn parse_repr(text: &str) -> Result<Self, StorageError> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        if digits.is_empty() || digits.len() > 16 {
            return Err(StorageError::InvalidOid(text.to_string()));
        }
        u64::from_str_radix(digits, 16)
            .map(Self::from_u64)
            .map_err(|_| StorageError::InvalidOid(text.to_string()))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.repr())
    }
}

impl FromStr for Oid {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_repr(s)
    }
}

impl Serialize for Oid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Oid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Transaction identifier, also the serial of every record it wrote
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid([u8; 8]);

impl Tid {
    /// Serial of an object that was never committed
    pub const ZERO: Self = Self([0; 8]);

    /// Create from integer
    #[inline]
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    /// Integer value
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    /// Raw bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Following transaction id
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self::from_u64(self.as_u64().saturating_add(1))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({self})")
    }
}

impl Serialize for Tid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(&text, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repr_strips_leading_zeros() {
        assert_eq!(Oid::ZERO.repr(), "0x00");
        assert_eq!(Oid::from_u64(1).repr(), "0x01");
        assert_eq!(Oid::from_u64(0x1f).repr(), "0x1f");
        assert_eq!(Oid::from_u64(0x100).repr(), "0x0100");
    }

    #[test]
    fn parse_repr_pads_to_eight_bytes() {
        assert_eq!(Oid::parse_repr("0x00").unwrap(), Oid::ZERO);
        assert_eq!(Oid::parse_repr("0x0100").unwrap(), Oid::from_u64(256));
        assert_eq!("1f".parse::<Oid>().unwrap(), Oid::from_u64(31));
        assert!(Oid::parse_repr("0x").is_err());
        assert!(Oid::parse_repr("0xzz").is_err());
        assert!(Oid::parse_repr("0x11223344556677889").is_err());
    }

    #[test]
    fn next_stops_at_end() {
        assert_eq!(Oid::ZERO.next(), Some(Oid::from_u64(1)));
        assert_eq!(Oid::from_u64(u64::MAX).next(), None);
    }

    #[test]
    fn slice_conversion() {
        assert_eq!(Oid::from_slice(&[0, 0, 0, 0, 0, 0, 0, 2]), Some(Oid::from_u64(2)));
        assert_eq!(Oid::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn tid_hex_round_trip() {
        let tid = Tid::from_u64(0x03d4_0000_0000_0001);
        let json = serde_json::to_string(&tid).unwrap();
        assert_eq!(json, "\"03d4000000000001\"");
        let back: Tid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tid);
        assert_eq!(tid.to_string(), "0x03d4000000000001");
    }
}
