//! Internal nodes.
//!
//! An internal node holds `(key, child)` pairs in key order. Pair 0 always
//! carries the empty key; pair `i` routes keys in `[key_i, key_{i+1})` to its
//! child.
//!
//! On a block each pair is `child` (8 bytes) followed by the serialized key.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::block::{Block, BlockId};
use crate::storage::btree::key::StoreKey;
use crate::storage::btree::node::{self, INTERNAL_MAGIC, NodeError};

const CHILD_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalPair {
    pub key: StoreKey,
    pub child: BlockId,
}

impl InternalPair {
    /// Bytes this pair occupies on a block, excluding its offset slot.
    #[must_use]
    pub fn size(&self) -> usize {
        CHILD_SIZE + self.key.serialized_size()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalNode {
    pub(super) pairs: Vec<InternalPair>,
}

impl InternalNode {
    /// A node with a single child covering the whole key space.
    #[must_use]
    pub fn with_child(child: BlockId) -> Self {
        Self {
            pairs: vec![InternalPair {
                key: StoreKey::min(),
                child,
            }],
        }
    }

    /// The root created when `left` splits into `left` and `right` at `median`.
    #[must_use]
    pub fn with_children(left: BlockId, median: StoreKey, right: BlockId) -> Self {
        Self {
            pairs: vec![
                InternalPair {
                    key: StoreKey::min(),
                    child: left,
                },
                InternalPair {
                    key: median,
                    child: right,
                },
            ],
        }
    }

    #[must_use]
    pub fn pairs(&self) -> &[InternalPair] {
        &self.pairs
    }

    #[must_use]
    pub fn npairs(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn child(&self, index: usize) -> Option<BlockId> {
        self.pairs.get(index).map(|pair| pair.child)
    }

    /// Index of the pair whose range contains `key`.
    #[must_use]
    pub fn child_index(&self, key: &StoreKey) -> usize {
        self.pairs
            .partition_point(|pair| pair.key <= *key)
            .saturating_sub(1)
    }

    #[must_use]
    pub fn index_of_child(&self, child: BlockId) -> Option<usize> {
        self.pairs.iter().position(|pair| pair.child == child)
    }

    /// Insert the separator produced by splitting a child; `child` becomes
    /// responsible for keys from `key` up to the next separator.
    pub fn insert(&mut self, key: StoreKey, child: BlockId) {
        let index = self.pairs.partition_point(|pair| pair.key <= key);
        self.pairs.insert(index, InternalPair { key, child });
    }

    /// Remove the pair at `index` (never pair 0).
    pub fn remove(&mut self, index: usize) -> Option<InternalPair> {
        (index > 0 && index < self.pairs.len()).then(|| self.pairs.remove(index))
    }

    pub fn set_key(&mut self, index: usize, key: StoreKey) {
        if let Some(pair) = self.pairs.get_mut(index).filter(|_| index > 0) {
            pair.key = key;
        }
    }

    /// Smallest real (routing) key, if any.
    #[must_use]
    pub fn first_key(&self) -> Option<&StoreKey> {
        self.pairs.get(1).map(|pair| &pair.key)
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&StoreKey> {
        self.pairs.iter().skip(1).last().map(|pair| &pair.key)
    }

    /// A two-child view of this node holding only the separator between the
    /// children at `right_index - 1` and `right_index`.
    #[must_use]
    pub fn separator_view(&self, right_index: usize) -> Option<Self> {
        let left = self.pairs.get(right_index.checked_sub(1)?)?;
        let right = self.pairs.get(right_index)?;
        Some(Self::with_children(
            left.child,
            right.key.clone(),
            right.child,
        ))
    }

    pub(super) fn live_size(&self) -> usize {
        self.pairs
            .iter()
            .map(|pair| pair.size() + node::PAIR_OFFSET_SIZE)
            .sum()
    }

    pub(super) fn from_block(block: &Block, block_size: usize) -> Result<Self, NodeError> {
        let header = node::read_header(block, block_size)?;
        if header.npairs == 0 {
            return Err(NodeError::EmptyInternalNode);
        }

        let mut pairs = Vec::with_capacity(header.npairs);
        for index in 0..header.npairs {
            let offset = node::pair_offset(block, index);
            if offset < header.frontmost || offset + CHILD_SIZE >= block_size {
                return Err(NodeError::PairOutOfBounds { index, offset });
            }
            let child = block.read_u64(offset);
            let key = StoreKey::read_from(block, offset + CHILD_SIZE, block_size)?;
            pairs.push(InternalPair { key, child });
        }
        Ok(Self { pairs })
    }

    pub(super) fn write_to_block(
        &self,
        block: &mut Block,
        block_size: usize,
    ) -> Result<(), NodeError> {
        node::layout_pairs(
            block,
            INTERNAL_MAGIC,
            block_size,
            &self.pairs,
            InternalPair::size,
            |block, offset, pair| {
                block.write_u64(offset, pair.child);
                pair.key.write_to(block, offset + CHILD_SIZE);
            },
        )
    }
}
