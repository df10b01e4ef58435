use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length in bytes of every [`ContentKey`].
pub const KEY_LEN: usize = 32;

/// Digest-derived identifier of a blob's content.
///
/// A `ContentKey` is produced by a hash function over the payload bytes.
/// Byte-identical content under the same function always yields the same key,
/// and a key never changes once computed. Keys carry no record of the function
/// that produced them; stores pair them with their function explicitly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    /// Wrap a pre-computed digest.
    pub const fn from_digest(digest: [u8; KEY_LEN]) -> Self {
        Self(digest)
    }

    /// Build a key from a digest slice, checking its length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Hex-encoded string representation (64 lowercase characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s.trim()).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", self.short_hex())
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; KEY_LEN]> for ContentKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<ContentKey> for [u8; KEY_LEN] {
    fn from(key: ContentKey) -> Self {
        key.0
    }
}

impl AsRef<[u8]> for ContentKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hex_roundtrip() {
        let key = ContentKey::from_digest([0xab; 32]);
        let parsed = ContentKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn display_is_full_hex() {
        let key = ContentKey::from_digest([7; 32]);
        let display = format!("{key}");
        assert_eq!(display.len(), 64);
        assert_eq!(display, key.to_hex());
    }

    #[test]
    fn debug_uses_short_hex() {
        let key = ContentKey::from_digest([0x01; 32]);
        assert_eq!(format!("{key:?}"), "ContentKey(01010101)");
    }

    #[test]
    fn from_hex_rejects_bad_characters() {
        let err = ContentKey::from_hex("zz").unwrap_err();
        assert!(matches!(err, TypeError::InvalidHex(_)));
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = ContentKey::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 2
            }
        );
    }

    #[test]
    fn from_str_trims_whitespace() {
        let key = ContentKey::from_digest([9; 32]);
        let parsed: ContentKey = format!(" {}\n", key.to_hex()).parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn serde_roundtrip() {
        let key = ContentKey::from_digest([3; 32]);
        let json = serde_json::to_string(&key).unwrap();
        let parsed: ContentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn ordering_is_consistent() {
        let k1 = ContentKey::from_digest([0; 32]);
        let k2 = ContentKey::from_digest([1; 32]);
        assert!(k1 < k2);
    }

    proptest! {
        #[test]
        fn any_digest_survives_hex(bytes in proptest::array::uniform32(any::<u8>())) {
            let key = ContentKey::from_digest(bytes);
            prop_assert_eq!(ContentKey::from_hex(&key.to_hex()).unwrap(), key);
        }
    }
}
