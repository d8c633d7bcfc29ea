//! Store keys.
//!
//! Keys are byte strings of at most [`MAX_KEY_SIZE`] bytes, ordered
//! lexicographically. On a block they are serialized as a one-byte length
//! followed by the key bytes.

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use crate::storage::block::Block;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 250;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_KEY_SIZE {
            return Err(KeyError::TooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// The empty key, which sorts before every other key.
    #[must_use]
    pub const fn min() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Bytes this key occupies on a block.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        1 + self.0.len()
    }

    pub(crate) fn write_to(&self, block: &mut Block, offset: usize) {
        block.write_u8(offset, self.0.len() as u8);
        block.write_bytes(offset + 1, &self.0);
    }

    /// Decode a key at `offset`, failing if it would extend past `limit`.
    pub(crate) fn read_from(block: &Block, offset: usize, limit: usize) -> Result<Self, KeyError> {
        let len = block
            .get_bytes(offset, 1)
            .ok_or(KeyError::Truncated)?
            .first()
            .copied()
            .map_or(0, usize::from);
        if len > MAX_KEY_SIZE {
            return Err(KeyError::TooLong(len));
        }
        if offset + 1 + len > limit {
            return Err(KeyError::Truncated);
        }
        let bytes = block.get_bytes(offset + 1, len).ok_or(KeyError::Truncated)?;
        Ok(Self(bytes.to_vec()))
    }
}

impl TryFrom<&str> for StoreKey {
    type Error = KeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes())
    }
}

impl TryFrom<&[u8]> for StoreKey {
    type Error = KeyError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    TooLong(usize),
    Truncated,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLong(len) => write!(f, "key of {len} bytes exceeds {MAX_KEY_SIZE} bytes"),
            Self::Truncated => write!(f, "key extends past the end of its block"),
        }
    }
}

impl std::error::Error for KeyError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::BLOCK_SIZE;

    #[test]
    fn test_key_length_limit() {
        assert!(StoreKey::new(vec![b'a'; MAX_KEY_SIZE]).is_ok());
        assert_eq!(
            StoreKey::new(vec![b'a'; MAX_KEY_SIZE + 1]),
            Err(KeyError::TooLong(MAX_KEY_SIZE + 1))
        );
    }

    #[test]
    fn test_empty_key_sorts_first() {
        let a = StoreKey::try_from("a").expect("valid key");
        let ab = StoreKey::try_from("ab").expect("valid key");
        assert!(StoreKey::min() < a);
        assert!(a < ab);
    }

    #[test]
    fn test_key_serialization() {
        let mut block = Block::new();
        let key = StoreKey::try_from("hello").expect("valid key");
        key.write_to(&mut block, 100);

        assert_eq!(block.read_u8(100), 5);
        let decoded = StoreKey::read_from(&block, 100, BLOCK_SIZE).expect("should decode");
        assert_eq!(decoded, key);
        assert_eq!(key.serialized_size(), 6);
    }

    #[test]
    fn test_read_rejects_truncated_and_oversized() {
        let mut block = Block::new();
        block.write_u8(BLOCK_SIZE - 2, 10);
        assert_eq!(
            StoreKey::read_from(&block, BLOCK_SIZE - 2, BLOCK_SIZE),
            Err(KeyError::Truncated)
        );

        block.write_u8(0, 251);
        assert_eq!(
            StoreKey::read_from(&block, 0, BLOCK_SIZE),
            Err(KeyError::TooLong(251))
        );
    }
}
