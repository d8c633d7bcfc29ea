//! Node layout and node-level algorithms.
//!
//! Every node shares the same block layout:
//!
//! - magic: 4 bytes (`inte` for internal nodes, the sizer's leaf magic otherwise)
//! - `npairs`: 2 bytes
//! - `frontmost_offset`: 2 bytes, start of the lowest-addressed pair
//! - `pair_offsets`: `npairs` × 2 bytes, in key order
//! - free space
//! - pair bodies, packed against the end of the block
//!
//! The algorithms here ([`split`], [`merge`], [`level`], [`is_underfull`],
//! [`is_mergable`], [`validate`]) work on decoded [`Node`]s and take the value
//! sizer as a parameter, so they never depend on a particular value encoding.
//!
//! # Invariants
//!
//! - Keys are strictly ascending; internal pair 0 carries the empty key
//! - Pair bodies lie in `[frontmost_offset, block_size)` and never overlap
//! - The offset table ends at or before `frontmost_offset`

#![allow(clippy::cast_possible_truncation)]

use crate::storage::block::{Block, BlockMagic};
use crate::storage::btree::internal::{InternalNode, InternalPair};
use crate::storage::btree::key::{KeyError, StoreKey};
use crate::storage::btree::leaf::LeafNode;
use crate::storage::btree::sizer::{ValueError, ValueSizer};

pub const INTERNAL_MAGIC: BlockMagic = *b"inte";

/// magic + npairs + `frontmost_offset`.
pub const NODE_HEADER_SIZE: usize = 8;

pub(crate) const PAIR_OFFSET_SIZE: usize = 2;

/// Offsets for node header fields.
mod offsets {
    pub const NPAIRS: usize = 4;
    pub const FRONTMOST: usize = 6;
    pub const PAIR_OFFSETS: usize = 8;
}

/// `true` if the block holds an internal node.
#[must_use]
pub fn is_internal(block: &Block) -> bool {
    block.magic() == INTERNAL_MAGIC
}

/// `true` unless the block holds an internal node.
#[must_use]
pub fn is_leaf(block: &Block) -> bool {
    !is_internal(block)
}

/// Which side of a node its sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingSide {
    Left,
    Right,
}

/// A decoded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    /// Decode a node, checking its magic against both node kinds.
    pub fn from_block(sizer: &dyn ValueSizer, block: &Block) -> Result<Self, NodeError> {
        let magic = block.magic();
        if magic == INTERNAL_MAGIC {
            InternalNode::from_block(block, sizer.default_block_size().value()).map(Self::Internal)
        } else if magic == sizer.leaf_magic() {
            LeafNode::from_block(sizer, block).map(Self::Leaf)
        } else {
            Err(NodeError::InvalidMagic(magic))
        }
    }

    /// Serialize into `block`, failing if the node does not fit.
    pub fn write_to_block(
        &self,
        sizer: &dyn ValueSizer,
        block: &mut Block,
    ) -> Result<(), NodeError> {
        match self {
            Self::Internal(internal) => {
                internal.write_to_block(block, sizer.default_block_size().value())?;
            }
            Self::Leaf(leaf) => leaf.write_to_block(sizer, block)?,
        }
        debug_assert_eq!(validate(sizer, block), Ok(()));
        Ok(())
    }

    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    #[must_use]
    pub const fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Self::Internal(internal) => Some(internal),
            Self::Leaf(_) => None,
        }
    }

    #[must_use]
    pub const fn as_leaf(&self) -> Option<&LeafNode> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Internal(_) => None,
        }
    }

    pub const fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match self {
            Self::Internal(internal) => Some(internal),
            Self::Leaf(_) => None,
        }
    }

    pub const fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Internal(_) => None,
        }
    }

    #[must_use]
    pub fn npairs(&self) -> usize {
        match self {
            Self::Internal(internal) => internal.npairs(),
            Self::Leaf(leaf) => leaf.npairs(),
        }
    }

    /// Bytes used by pair bodies and their offset slots.
    #[must_use]
    pub fn live_size(&self, sizer: &dyn ValueSizer) -> usize {
        match self {
            Self::Internal(internal) => internal.live_size(),
            Self::Leaf(leaf) => leaf.live_size(sizer),
        }
    }

    /// Smallest real key (internal pair 0 does not count).
    #[must_use]
    pub fn first_key(&self) -> Option<&StoreKey> {
        match self {
            Self::Internal(internal) => internal.first_key(),
            Self::Leaf(leaf) => leaf.first_key(),
        }
    }

    #[must_use]
    pub fn last_key(&self) -> Option<&StoreKey> {
        match self {
            Self::Internal(internal) => internal.last_key(),
            Self::Leaf(leaf) => leaf.last_key(),
        }
    }

    fn pair_sizes(&self, sizer: &dyn ValueSizer) -> Vec<usize> {
        match self {
            Self::Internal(internal) => internal
                .pairs
                .iter()
                .map(|pair| pair.size() + PAIR_OFFSET_SIZE)
                .collect(),
            Self::Leaf(leaf) => leaf
                .pairs
                .iter()
                .map(|pair| pair.size(sizer) + PAIR_OFFSET_SIZE)
                .collect(),
        }
    }
}

pub(crate) struct NodeHeader {
    pub npairs: usize,
    pub frontmost: usize,
}

pub(crate) fn read_header(block: &Block, block_size: usize) -> Result<NodeHeader, NodeError> {
    let npairs = usize::from(block.read_u16(offsets::NPAIRS));
    let frontmost = usize::from(block.read_u16(offsets::FRONTMOST));
    let table_end = NODE_HEADER_SIZE + npairs * PAIR_OFFSET_SIZE;
    if table_end > frontmost || frontmost > block_size {
        return Err(NodeError::BadFrontmostOffset(frontmost));
    }
    Ok(NodeHeader { npairs, frontmost })
}

pub(crate) fn pair_offset(block: &Block, index: usize) -> usize {
    usize::from(block.read_u16(offsets::PAIR_OFFSETS + index * PAIR_OFFSET_SIZE))
}

/// Write a node header and lay `pairs` out from the end of the block
/// towards the header, recording each offset in key order.
pub(crate) fn layout_pairs<T>(
    block: &mut Block,
    magic: BlockMagic,
    block_size: usize,
    pairs: &[T],
    size_of: impl Fn(&T) -> usize,
    write: impl Fn(&mut Block, usize, &T),
) -> Result<(), NodeError> {
    let required = NODE_HEADER_SIZE
        + pairs
            .iter()
            .map(|pair| size_of(pair) + PAIR_OFFSET_SIZE)
            .sum::<usize>();
    if required > block_size {
        return Err(NodeError::NodeFull {
            required,
            available: block_size,
        });
    }

    block.as_bytes_mut().fill(0);
    block.set_magic(magic);
    let mut frontmost = block_size;
    for (index, pair) in pairs.iter().enumerate() {
        frontmost -= size_of(pair);
        write(block, frontmost, pair);
        block.write_u16(
            offsets::PAIR_OFFSETS + index * PAIR_OFFSET_SIZE,
            frontmost as u16,
        );
    }
    block.write_u16(offsets::NPAIRS, pairs.len() as u16);
    block.write_u16(offsets::FRONTMOST, frontmost as u16);
    Ok(())
}

/// Bytes available to pairs and their offset slots.
#[must_use]
pub fn capacity(sizer: &dyn ValueSizer) -> usize {
    sizer.default_block_size().value() - NODE_HEADER_SIZE
}

/// Below this live size a non-root node is underfull.
#[must_use]
pub fn underfull_threshold(sizer: &dyn ValueSizer) -> usize {
    capacity(sizer) / 2
}

#[must_use]
pub fn fits(sizer: &dyn ValueSizer, node: &Node) -> bool {
    node.live_size(sizer) <= capacity(sizer)
}

#[must_use]
pub fn is_underfull(sizer: &dyn ValueSizer, node: &Node) -> bool {
    node.live_size(sizer) < underfull_threshold(sizer)
}

/// Locate the separator in `parent` between adjacent siblings `left` and
/// `right`. Fails if the key ranges show the two are not adjacent.
fn find_separator<'a>(
    left: &Node,
    right: &Node,
    parent: &'a InternalNode,
) -> Result<&'a StoreKey, NodeError> {
    let separators = parent.pairs.get(1..).unwrap_or_default();

    let index = match (left.last_key(), right.first_key()) {
        (Some(left_max), _) => separators.partition_point(|pair| pair.key <= *left_max),
        (None, Some(right_min)) => separators
            .partition_point(|pair| pair.key <= *right_min)
            .checked_sub(1)
            .ok_or(NodeError::NotAdjacent)?,
        (None, None) if separators.len() == 1 => 0,
        (None, None) => return Err(NodeError::NotAdjacent),
    };
    let separator = &separators.get(index).ok_or(NodeError::NotAdjacent)?.key;

    if let Some(right_min) = right.first_key() {
        let skips_a_sibling = separators
            .get(index + 1)
            .is_some_and(|next| next.key <= *right_min);
        if right_min < separator || skips_a_sibling {
            return Err(NodeError::NotAdjacent);
        }
    }
    if left.last_key().is_some_and(|left_max| left_max >= separator) {
        return Err(NodeError::NotAdjacent);
    }
    Ok(separator)
}

/// Live size of `left` merged with `right`, or `None` if they cannot merge.
fn merged_size(
    sizer: &dyn ValueSizer,
    left: &Node,
    right: &Node,
    separator: &StoreKey,
) -> Option<usize> {
    match (left, right) {
        (Node::Leaf(_), Node::Leaf(_)) => Some(left.live_size(sizer) + right.live_size(sizer)),
        // The right node's empty pair-0 key becomes the separator.
        (Node::Internal(_), Node::Internal(_)) => {
            Some(left.live_size(sizer) + right.live_size(sizer) + separator.len())
        }
        _ => None,
    }
}

/// Whether `node` and its right sibling `sibling` fit in one node.
///
/// `parent` must hold the separator between them; siblings that the
/// separator shows are not adjacent are never mergable.
#[must_use]
pub fn is_mergable(
    sizer: &dyn ValueSizer,
    node: &Node,
    sibling: &Node,
    parent: &InternalNode,
) -> bool {
    let Ok(separator) = find_separator(node, sibling, parent) else {
        return false;
    };
    merged_size(sizer, node, sibling, separator).is_some_and(|size| size <= capacity(sizer))
}

/// Split `node` in two by cumulative byte size.
///
/// `node` keeps the lower half. Returns the upper half and the median key
/// that routes to it. For internal nodes the median is moved out of the
/// upper half, whose pair 0 becomes the empty key.
pub fn split(sizer: &dyn ValueSizer, node: &mut Node) -> Result<(Node, StoreKey), NodeError> {
    let sizes = node.pair_sizes(sizer);
    if sizes.len() < 2 {
        return Err(NodeError::CannotSplit(sizes.len()));
    }
    let split_at = split_point(&sizes);

    // Check both halves before touching `node`, so a failed split leaves it whole.
    let left_size: usize = sizes[..split_at].iter().sum();
    let mut right_size: usize = sizes[split_at..].iter().sum();
    if let Node::Internal(internal) = &*node {
        right_size -= internal.pairs[split_at].key.len();
    }
    for size in [left_size, right_size] {
        if size > capacity(sizer) {
            return Err(NodeError::NodeFull {
                required: NODE_HEADER_SIZE + size,
                available: sizer.default_block_size().value(),
            });
        }
    }

    let split = match node {
        Node::Leaf(leaf) => {
            let right = LeafNode {
                pairs: leaf.pairs.split_off(split_at),
            };
            let median = right.pairs[0].key.clone();
            (Node::Leaf(right), median)
        }
        Node::Internal(internal) => {
            let mut pairs = internal.pairs.split_off(split_at);
            let median = std::mem::take(&mut pairs[0].key);
            (Node::Internal(InternalNode { pairs }), median)
        }
    };
    debug_assert!(fits(sizer, node) && fits(sizer, &split.0));
    Ok(split)
}

/// First index at which the left half holds at least half the bytes,
/// clamped so both halves are non-empty.
fn split_point(sizes: &[usize]) -> usize {
    let total: usize = sizes.iter().sum();
    let mut accumulated = 0;
    for (index, size) in sizes.iter().enumerate() {
        accumulated += size;
        if accumulated * 2 >= total {
            return (index + 1).clamp(1, sizes.len() - 1);
        }
    }
    sizes.len() - 1
}

/// Merge right sibling `rnode` into `node`. Inverse of [`split`].
pub fn merge(
    sizer: &dyn ValueSizer,
    node: &mut Node,
    rnode: Node,
    parent: &InternalNode,
) -> Result<(), NodeError> {
    let separator = find_separator(node, &rnode, parent)?.clone();
    let size = merged_size(sizer, node, &rnode, &separator).ok_or(NodeError::MismatchedNodes)?;
    if size > capacity(sizer) {
        return Err(NodeError::NodeFull {
            required: NODE_HEADER_SIZE + size,
            available: sizer.default_block_size().value(),
        });
    }

    match (node, rnode) {
        (Node::Leaf(left), Node::Leaf(right)) => left.pairs.extend(right.pairs),
        (Node::Internal(left), Node::Internal(mut right)) => {
            right.pairs[0].key = separator;
            left.pairs.extend(right.pairs);
        }
        _ => return Err(NodeError::MismatchedNodes),
    }
    Ok(())
}

/// Move pairs from `sibling` into `node` until their sizes are as even as
/// whole pairs allow.
///
/// `side` says where `sibling` sits relative to `node`. Returns the new
/// separator to store in the parent, or `None` if nothing moved.
pub fn level(
    sizer: &dyn ValueSizer,
    node: &mut Node,
    sibling: &mut Node,
    side: SiblingSide,
    parent: &InternalNode,
) -> Result<Option<StoreKey>, NodeError> {
    let separator = match side {
        SiblingSide::Right => find_separator(node, sibling, parent)?,
        SiblingSide::Left => find_separator(sibling, node, parent)?,
    }
    .clone();

    match (node, sibling) {
        (Node::Leaf(receiver), Node::Leaf(donor)) => Ok(level_leaves(sizer, receiver, donor, side)),
        (Node::Internal(receiver), Node::Internal(donor)) => {
            Ok(level_internals(receiver, donor, side, separator))
        }
        _ => Err(NodeError::MismatchedNodes),
    }
}

fn level_leaves(
    sizer: &dyn ValueSizer,
    receiver: &mut LeafNode,
    donor: &mut LeafNode,
    side: SiblingSide,
) -> Option<StoreKey> {
    let mut receiver_size = receiver.live_size(sizer);
    let mut donor_size = donor.live_size(sizer);
    let mut moved = false;

    while donor.pairs.len() > 1 {
        let candidate = match side {
            SiblingSide::Right => donor.pairs.first(),
            SiblingSide::Left => donor.pairs.last(),
        }?;
        let size = candidate.size(sizer) + PAIR_OFFSET_SIZE;
        if receiver_size + size > donor_size - size {
            break;
        }
        match side {
            SiblingSide::Right => {
                let pair = donor.pairs.remove(0);
                receiver.pairs.push(pair);
            }
            SiblingSide::Left => {
                let pair = donor.pairs.pop()?;
                receiver.pairs.insert(0, pair);
            }
        }
        receiver_size += size;
        donor_size -= size;
        moved = true;
    }

    if !moved {
        return None;
    }
    match side {
        SiblingSide::Right => donor.first_key().cloned(),
        SiblingSide::Left => receiver.first_key().cloned(),
    }
}

fn level_internals(
    receiver: &mut InternalNode,
    donor: &mut InternalNode,
    side: SiblingSide,
    mut separator: StoreKey,
) -> Option<StoreKey> {
    let mut receiver_size = receiver.live_size();
    let mut donor_size = donor.live_size();
    let mut moved = false;
    let empty_pair_size = StoreKey::min().serialized_size() + 8 + PAIR_OFFSET_SIZE;

    // Every move rotates one child through the parent's separator.
    while donor.pairs.len() > 2 {
        let outgoing_key_len = match side {
            SiblingSide::Right => donor.pairs[1].key.len(),
            SiblingSide::Left => donor.pairs.last()?.key.len(),
        };
        let gain = empty_pair_size + separator.len();
        let loss = empty_pair_size + outgoing_key_len;
        if receiver_size + gain > donor_size - loss {
            break;
        }

        match side {
            SiblingSide::Right => {
                let first = donor.pairs.remove(0);
                let next_separator = std::mem::take(&mut donor.pairs[0].key);
                receiver.pairs.push(InternalPair {
                    key: separator,
                    child: first.child,
                });
                separator = next_separator;
            }
            SiblingSide::Left => {
                let last = donor.pairs.pop()?;
                receiver.pairs[0].key = separator;
                receiver.pairs.insert(
                    0,
                    InternalPair {
                        key: StoreKey::min(),
                        child: last.child,
                    },
                );
                separator = last.key;
            }
        }
        receiver_size += gain;
        donor_size -= loss;
        moved = true;
    }

    moved.then_some(separator)
}

/// Full structural check of a node block.
///
/// Verifies the magic, that the offset table and every pair lie inside the
/// block, that pairs do not overlap and start at `frontmost_offset`, that
/// keys are strictly ascending, and that internal pair 0 has the empty key.
pub fn validate(sizer: &dyn ValueSizer, block: &Block) -> Result<(), NodeError> {
    let block_size = sizer.default_block_size().value();
    let node = Node::from_block(sizer, block)?;
    let header = read_header(block, block_size)?;

    if node
        .as_internal()
        .is_some_and(|internal| !internal.pairs[0].key.is_empty())
    {
        return Err(NodeError::NonEmptyLeftmostKey);
    }

    let keys: Vec<&StoreKey> = match &node {
        Node::Internal(internal) => internal.pairs.iter().map(|pair| &pair.key).collect(),
        Node::Leaf(leaf) => leaf.pairs.iter().map(|pair| &pair.key).collect(),
    };
    if let Some(index) = keys.windows(2).position(|pair| pair[0] >= pair[1]) {
        return Err(NodeError::KeysOutOfOrder { index: index + 1 });
    }

    let mut extents: Vec<(usize, usize)> = node
        .pair_sizes(sizer)
        .iter()
        .enumerate()
        .map(|(index, size)| {
            let offset = pair_offset(block, index);
            (offset, offset + size - PAIR_OFFSET_SIZE)
        })
        .collect();
    extents.sort_unstable();

    if let Some(pair) = extents.windows(2).find(|pair| pair[0].1 > pair[1].0) {
        return Err(NodeError::OverlappingPairs { offset: pair[1].0 });
    }
    let packed_start = extents.first().map_or(block_size, |(offset, _)| *offset);
    if packed_start != header.frontmost {
        return Err(NodeError::BadFrontmostOffset(header.frontmost));
    }
    Ok(())
}

/// Errors from node decoding and node algorithms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    InvalidMagic(BlockMagic),
    BadFrontmostOffset(usize),
    PairOutOfBounds { index: usize, offset: usize },
    OverlappingPairs { offset: usize },
    KeysOutOfOrder { index: usize },
    NonEmptyLeftmostKey,
    EmptyInternalNode,
    Key(KeyError),
    Value(ValueError),
    NodeFull { required: usize, available: usize },
    CannotSplit(usize),
    NotAdjacent,
    MismatchedNodes,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(f, "invalid node magic: {:?}", String::from_utf8_lossy(magic))
            }
            Self::BadFrontmostOffset(offset) => write!(f, "bad frontmost offset: {offset}"),
            Self::PairOutOfBounds { index, offset } => {
                write!(f, "pair {index} at offset {offset} is out of bounds")
            }
            Self::OverlappingPairs { offset } => {
                write!(f, "pair at offset {offset} overlaps its neighbour")
            }
            Self::KeysOutOfOrder { index } => write!(f, "key {index} is out of order"),
            Self::NonEmptyLeftmostKey => write!(f, "internal pair 0 has a non-empty key"),
            Self::EmptyInternalNode => write!(f, "internal node has no children"),
            Self::Key(e) => write!(f, "key error: {e}"),
            Self::Value(e) => write!(f, "value error: {e}"),
            Self::NodeFull {
                required,
                available,
            } => write!(f, "node needs {required} bytes, block has {available}"),
            Self::CannotSplit(npairs) => write!(f, "cannot split a node with {npairs} pairs"),
            Self::NotAdjacent => write!(f, "nodes are not adjacent siblings"),
            Self::MismatchedNodes => write!(f, "cannot combine a leaf with an internal node"),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<KeyError> for NodeError {
    fn from(e: KeyError) -> Self {
        Self::Key(e)
    }
}

impl From<ValueError> for NodeError {
    fn from(e: ValueError) -> Self {
        Self::Value(e)
    }
}
