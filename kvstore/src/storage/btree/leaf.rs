//! Leaf nodes.
//!
//! A leaf holds `(key, value)` pairs in key order, each stamped with the
//! replication timestamp of the mutation that last wrote it. On a block a
//! pair is `timestamp` (8 bytes), the serialized key, then the value whose
//! length only the [`ValueSizer`] knows.

use crate::storage::block::Block;
use crate::storage::btree::key::StoreKey;
use crate::storage::btree::node::{self, NodeError};
use crate::storage::btree::sizer::{ValueError, ValueSizer};
use crate::timestamp::ReplTimestamp;

const TIMESTAMP_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPair {
    pub key: StoreKey,
    pub timestamp: ReplTimestamp,
    pub value: Vec<u8>,
}

impl LeafPair {
    /// Bytes this pair occupies on a block, excluding its offset slot.
    #[must_use]
    pub fn size(&self, sizer: &dyn ValueSizer) -> usize {
        TIMESTAMP_SIZE + self.key.serialized_size() + sizer.size(&self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafNode {
    pub(super) pairs: Vec<LeafPair>,
}

impl LeafNode {
    #[must_use]
    pub const fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    #[must_use]
    pub fn pairs(&self) -> &[LeafPair] {
        &self.pairs
    }

    #[must_use]
    pub fn npairs(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    #[must_use]
    pub fn find(&self, key: &StoreKey) -> Option<&LeafPair> {
        self.pairs
            .binary_search_by(|pair| pair.key.cmp(key))
            .ok()
            .map(|index| &self.pairs[index])
    }

    /// Insert or replace; returns the previous value if the key existed.
    pub fn insert(
        &mut self,
        key: StoreKey,
        value: Vec<u8>,
        timestamp: ReplTimestamp,
    ) -> Option<Vec<u8>> {
        match self.pairs.binary_search_by(|pair| pair.key.cmp(&key)) {
            Ok(index) => {
                let pair = &mut self.pairs[index];
                pair.timestamp = timestamp;
                Some(std::mem::replace(&mut pair.value, value))
            }
            Err(index) => {
                self.pairs.insert(
                    index,
                    LeafPair {
                        key,
                        timestamp,
                        value,
                    },
                );
                None
            }
        }
    }

    pub fn remove(&mut self, key: &StoreKey) -> Option<LeafPair> {
        self.pairs
            .binary_search_by(|pair| pair.key.cmp(key))
            .ok()
            .map(|index| self.pairs.remove(index))
    }

    #[must_use]
    pub fn first_key(&self) -> Option<&StoreKey> {
        self.pairs.first().map(|pair| &pair.key)
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&StoreKey> {
        self.pairs.last().map(|pair| &pair.key)
    }

    pub(super) fn live_size(&self, sizer: &dyn ValueSizer) -> usize {
        self.pairs
            .iter()
            .map(|pair| pair.size(sizer) + node::PAIR_OFFSET_SIZE)
            .sum()
    }

    pub(super) fn from_block(sizer: &dyn ValueSizer, block: &Block) -> Result<Self, NodeError> {
        let block_size = sizer.default_block_size().value();
        let header = node::read_header(block, block_size)?;

        let mut pairs = Vec::with_capacity(header.npairs);
        for index in 0..header.npairs {
            let offset = node::pair_offset(block, index);
            if offset < header.frontmost || offset + TIMESTAMP_SIZE >= block_size {
                return Err(NodeError::PairOutOfBounds { index, offset });
            }
            let timestamp = ReplTimestamp::new(block.read_u64(offset));
            let key = StoreKey::read_from(block, offset + TIMESTAMP_SIZE, block_size)?;

            let value_offset = offset + TIMESTAMP_SIZE + key.serialized_size();
            let available = block_size - value_offset;
            let bytes = block
                .get_bytes(value_offset, available)
                .ok_or(NodeError::PairOutOfBounds { index, offset })?;
            if !sizer.fits(bytes, available) {
                return Err(NodeError::Value(ValueError::Malformed));
            }
            let value = bytes[..sizer.size(bytes)].to_vec();

            pairs.push(LeafPair {
                key,
                timestamp,
                value,
            });
        }
        Ok(Self { pairs })
    }

    pub(super) fn write_to_block(
        &self,
        sizer: &dyn ValueSizer,
        block: &mut Block,
    ) -> Result<(), NodeError> {
        node::layout_pairs(
            block,
            sizer.leaf_magic(),
            sizer.default_block_size().value(),
            &self.pairs,
            |pair| pair.size(sizer),
            |block, offset, pair| {
                block.write_u64(offset, pair.timestamp.time());
                pair.key.write_to(block, offset + TIMESTAMP_SIZE);
                let value_len = sizer.size(&pair.value);
                block.write_bytes(
                    offset + TIMESTAMP_SIZE + pair.key.serialized_size(),
                    &pair.value[..value_len],
                );
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::sizer::{MemcachedValue, MemcachedValueSizer};

    fn key(s: &str) -> StoreKey {
        StoreKey::try_from(s).expect("valid key")
    }

    fn value(data: &[u8]) -> Vec<u8> {
        MemcachedValue::new(data.to_vec(), 0, 0)
            .encode()
            .expect("should encode")
    }

    #[test]
    fn test_insert_keeps_order_and_replaces() {
        let mut leaf = LeafNode::new();
        assert!(leaf.insert(key("b"), value(b"2"), ReplTimestamp::new(1)).is_none());
        assert!(leaf.insert(key("a"), value(b"1"), ReplTimestamp::new(2)).is_none());
        let old = leaf.insert(key("b"), value(b"3"), ReplTimestamp::new(3));

        assert_eq!(old, Some(value(b"2")));
        assert_eq!(leaf.first_key(), Some(&key("a")));
        let b = leaf.find(&key("b")).expect("b present");
        assert_eq!(b.value, value(b"3"));
        assert_eq!(b.timestamp, ReplTimestamp::new(3));
    }

    #[test]
    fn test_remove() {
        let mut leaf = LeafNode::new();
        leaf.insert(key("a"), value(b"1"), ReplTimestamp::new(1));
        assert!(leaf.remove(&key("zz")).is_none());
        assert_eq!(leaf.remove(&key("a")).map(|p| p.value), Some(value(b"1")));
        assert!(leaf.is_empty());
    }

    #[test]
    fn test_block_roundtrip() {
        let sizer = MemcachedValueSizer;
        let mut leaf = LeafNode::new();
        leaf.insert(key("alpha"), value(b"first"), ReplTimestamp::new(10));
        leaf.insert(key("beta"), value(&[9; 300]), ReplTimestamp::new(11));

        let mut block = Block::new();
        leaf.write_to_block(&sizer, &mut block).expect("should fit");
        assert_eq!(block.magic(), sizer.leaf_magic());

        let decoded = LeafNode::from_block(&sizer, &block).expect("should decode");
        assert_eq!(decoded, leaf);
    }
}
