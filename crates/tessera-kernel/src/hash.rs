//! Stable name hashes
//!
//! Type and event identifiers are 32-bit FNV-1a hashes of their names. The
//! hash depends only on the bytes of the name, so identifiers are stable
//! across processes, plugin generations and the managed runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit hash of a name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct StringHash(u32);

impl StringHash {
    /// Hash of the empty string.
    pub const EMPTY: StringHash = StringHash::new("");

    /// Hash a name
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash = FNV_OFFSET_BASIS;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
            i += 1;
        }
        Self(hash)
    }

    /// Wrap a raw hash value received from the other side of the bridge
    pub const fn from_value(value: u32) -> Self {
        Self(value)
    }

    /// Raw hash value
    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == Self::EMPTY.0
    }
}

impl fmt::Display for StringHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

impl From<&str> for StringHash {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<u32> for StringHash {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Identifier of a registrable type
pub type TypeId = StringHash;

/// Identifier of an event type
pub type EventId = StringHash;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        // Reference values of 32-bit FNV-1a.
        assert_eq!(StringHash::new("").value(), 0x811c_9dc5);
        assert_eq!(StringHash::new("a").value(), 0xe40c_292c);
        assert_eq!(StringHash::new("foobar").value(), 0xbf9c_f968);
    }

    #[test]
    fn test_hash_equality_by_value() {
        const FOO: TypeId = StringHash::new("Foo");
        assert_eq!(FOO, StringHash::from("Foo"));
        assert_eq!(FOO, StringHash::from_value(FOO.value()));
        assert_ne!(FOO, StringHash::new("foo"));
        assert!(StringHash::EMPTY.is_empty());
        assert!(!FOO.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(StringHash::from_value(0xab).to_string(), "#000000ab");
    }
}
