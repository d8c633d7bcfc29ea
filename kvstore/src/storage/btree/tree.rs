//! B-tree over a block cache.
//!
//! The tree's root, statblock and metainfo are found through the superblock.
//! Inserts split overfull nodes bottom-up, growing a new root when the old
//! root splits. Deletes merge or level underfull nodes with a sibling and
//! collapse a root left with a single child.
//!
//! Every leaf pair carries the replication timestamp of its last write, and
//! the tree remembers when each deleted key was removed, so [`BTree::backfill`]
//! can replay everything that changed since a given timestamp.

use std::collections::BTreeMap;
use std::ops::ControlFlow;

use crate::storage::block::{Block, BlockId, NULL_BLOCK_ID, SUPERBLOCK_ID};
use crate::storage::btree::internal::InternalNode;
use crate::storage::btree::key::StoreKey;
use crate::storage::btree::leaf::{LeafNode, LeafPair};
use crate::storage::btree::node::{self, Node, NodeError, SiblingSide};
use crate::storage::btree::sizer::{ValueError, ValueSizer};
use crate::storage::cache::{BlockCache, BlockCacheError};
use crate::storage::superblock::{Statblock, Superblock, SuperblockError};
use crate::timestamp::ReplTimestamp;

/// Guards descents against cycles in a corrupt tree.
const MAX_TREE_DEPTH: usize = 64;

/// One change replayed by [`BTree::backfill`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillAtom {
    Set {
        key: StoreKey,
        value: Vec<u8>,
        timestamp: ReplTimestamp,
    },
    Delete {
        key: StoreKey,
        timestamp: ReplTimestamp,
    },
}

impl BackfillAtom {
    #[must_use]
    pub const fn key(&self) -> &StoreKey {
        match self {
            Self::Set { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    #[must_use]
    pub const fn timestamp(&self) -> ReplTimestamp {
        match self {
            Self::Set { timestamp, .. } | Self::Delete { timestamp, .. } => *timestamp,
        }
    }
}

/// A B-tree whose values are encoded as described by `S`.
#[derive(Debug)]
pub struct BTree<S: ValueSizer> {
    cache: BlockCache,
    sizer: S,
    superblock: Superblock,
    /// In-memory tombstones replayed by [`backfill`](Self::backfill). Not
    /// persisted, so a reopened tree has none. Bounded by
    /// [`forget_deletions_before`](Self::forget_deletions_before).
    deletions: BTreeMap<StoreKey, ReplTimestamp>,
}

type Path = Vec<(BlockId, Node)>;

impl<S: ValueSizer> BTree<S> {
    /// Create an empty tree: a statblock, an empty root leaf and a superblock
    /// pointing at both.
    pub fn create(mut cache: BlockCache, sizer: S) -> Result<Self, BTreeError> {
        let stat_block = cache.allocate();
        cache.write(stat_block, Statblock::default().to_block())?;

        let mut tree = Self {
            cache,
            sizer,
            superblock: Superblock::new(),
            deletions: BTreeMap::new(),
        };
        let root = tree.cache.allocate();
        tree.write_node(root, &Node::Leaf(LeafNode::new()))?;
        tree.superblock.root_block = root;
        tree.superblock.stat_block = stat_block;
        tree.write_superblock()?;
        Ok(tree)
    }

    /// Open a tree previously created in `cache`.
    pub fn open(cache: BlockCache, sizer: S) -> Result<Self, BTreeError> {
        let superblock = Superblock::from_block(cache.read(SUPERBLOCK_ID)?)?;
        if superblock.root_block == NULL_BLOCK_ID {
            return Err(BTreeError::MissingRoot);
        }
        Ok(Self {
            cache,
            sizer,
            superblock,
            deletions: BTreeMap::new(),
        })
    }

    /// Give back the underlying cache.
    #[must_use]
    pub fn into_cache(self) -> BlockCache {
        self.cache
    }

    #[must_use]
    pub const fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    #[must_use]
    pub const fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn set_metainfo(&mut self, blob: &[u8]) -> Result<(), BTreeError> {
        self.superblock.set_metainfo(blob)?;
        self.write_superblock()
    }

    /// Number of live keys, as recorded in the statblock.
    pub fn population(&self) -> Result<i64, BTreeError> {
        let stats = Statblock::from_block(self.cache.read(self.superblock.stat_block)?)?;
        Ok(stats.population)
    }

    pub fn get(&self, key: &StoreKey) -> Result<Option<LeafPair>, BTreeError> {
        let path = self.path_to_leaf(key)?;
        Ok(path
            .last()
            .and_then(|(_, node)| node.as_leaf())
            .and_then(|leaf| leaf.find(key))
            .cloned())
    }

    /// Insert or replace `key`. Returns the previous value, if any.
    pub fn set(
        &mut self,
        key: StoreKey,
        value: Vec<u8>,
        timestamp: ReplTimestamp,
    ) -> Result<Option<Vec<u8>>, BTreeError> {
        if !self.sizer.fits(&value, value.len()) || self.sizer.size(&value) != value.len() {
            return Err(NodeError::Value(ValueError::Malformed).into());
        }

        let mut path = self.path_to_leaf(&key)?;
        let (leaf_id, mut leaf_node) = path.pop().ok_or(BTreeError::MissingRoot)?;
        let leaf = leaf_node
            .as_leaf_mut()
            .ok_or(BTreeError::Corrupt(leaf_id))?;

        self.deletions.remove(&key);
        let old = leaf.insert(key, value, timestamp);
        if old.is_none() {
            self.adjust_population(1)?;
        }
        self.store_with_splits(path, leaf_id, leaf_node)?;
        Ok(old)
    }

    /// Remove `key`, remembering when it was deleted. Returns the removed value.
    pub fn delete(
        &mut self,
        key: &StoreKey,
        timestamp: ReplTimestamp,
    ) -> Result<Option<Vec<u8>>, BTreeError> {
        let mut path = self.path_to_leaf(key)?;
        let (leaf_id, mut leaf_node) = path.pop().ok_or(BTreeError::MissingRoot)?;
        let leaf = leaf_node
            .as_leaf_mut()
            .ok_or(BTreeError::Corrupt(leaf_id))?;

        let Some(removed) = leaf.remove(key) else {
            return Ok(None);
        };
        self.deletions.insert(key.clone(), timestamp);
        self.adjust_population(-1)?;
        self.rebalance(path, leaf_id, leaf_node)?;
        Ok(Some(removed.value))
    }

    /// Replay every key written at or after `since` in key order, then every
    /// deletion at or after `since`. Stops early if `visit` breaks.
    pub fn backfill(
        &self,
        since: ReplTimestamp,
        visit: &mut dyn FnMut(BackfillAtom) -> ControlFlow<()>,
    ) -> Result<(), BTreeError> {
        let mut stack = vec![(self.superblock.root_block, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            if depth > MAX_TREE_DEPTH {
                return Err(BTreeError::Corrupt(id));
            }
            match self.read_node(id)? {
                Node::Internal(internal) => {
                    stack.extend(internal.pairs().iter().rev().map(|pair| (pair.child, depth + 1)));
                }
                Node::Leaf(leaf) => {
                    for pair in leaf.pairs().iter().filter(|pair| pair.timestamp >= since) {
                        let atom = BackfillAtom::Set {
                            key: pair.key.clone(),
                            value: pair.value.clone(),
                            timestamp: pair.timestamp,
                        };
                        if visit(atom).is_break() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        for (key, timestamp) in self.deletions.iter().filter(|(_, ts)| **ts >= since) {
            let atom = BackfillAtom::Delete {
                key: key.clone(),
                timestamp: *timestamp,
            };
            if visit(atom).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Drop tombstones older than `horizon`. Returns how many were dropped.
    pub fn forget_deletions_before(&mut self, horizon: ReplTimestamp) -> usize {
        let before = self.deletions.len();
        self.deletions.retain(|_, timestamp| *timestamp >= horizon);
        before - self.deletions.len()
    }

    #[must_use]
    pub fn deletion_count(&self) -> usize {
        self.deletions.len()
    }

    /// Check every node block and that every key lies within the range its
    /// parent routes to it.
    pub fn validate_all(&self) -> Result<(), BTreeError> {
        let mut stack = vec![(
            self.superblock.root_block,
            None::<StoreKey>,
            None::<StoreKey>,
            0usize,
        )];
        while let Some((id, low, high, depth)) = stack.pop() {
            if depth > MAX_TREE_DEPTH {
                return Err(BTreeError::Corrupt(id));
            }
            let block = self.cache.read(id)?;
            node::validate(&self.sizer, block)?;

            let node = Node::from_block(&self.sizer, block)?;
            let out_of_range = |key: &StoreKey| {
                low.as_ref().is_some_and(|low| key < low)
                    || high.as_ref().is_some_and(|high| key >= high)
            };
            if node.first_key().is_some_and(out_of_range)
                || node.last_key().is_some_and(out_of_range)
            {
                return Err(BTreeError::Corrupt(id));
            }

            if let Node::Internal(internal) = node {
                let pairs = internal.pairs();
                for (index, pair) in pairs.iter().enumerate() {
                    let child_low = if index == 0 { low.clone() } else { Some(pair.key.clone()) };
                    let child_high = pairs
                        .get(index + 1)
                        .map(|next| next.key.clone())
                        .or_else(|| high.clone());
                    stack.push((pair.child, child_low, child_high, depth + 1));
                }
            }
        }
        Ok(())
    }

    /// Depth of the tree; a lone root leaf has depth 1.
    pub fn depth(&self) -> Result<usize, BTreeError> {
        Ok(self.path_to_leaf(&StoreKey::min())?.len())
    }

    fn read_node(&self, id: BlockId) -> Result<Node, BTreeError> {
        Ok(Node::from_block(&self.sizer, self.cache.read(id)?)?)
    }

    fn write_node(&mut self, id: BlockId, node: &Node) -> Result<(), BTreeError> {
        let mut block = Block::new();
        node.write_to_block(&self.sizer, &mut block)?;
        self.cache.write(id, block)?;
        Ok(())
    }

    fn write_superblock(&mut self) -> Result<(), BTreeError> {
        self.cache.write(SUPERBLOCK_ID, self.superblock.to_block())?;
        Ok(())
    }

    fn adjust_population(&mut self, delta: i64) -> Result<(), BTreeError> {
        let stat_block = self.superblock.stat_block;
        let mut stats = Statblock::from_block(self.cache.read(stat_block)?)?;
        stats.population += delta;
        self.cache.write(stat_block, stats.to_block())?;
        Ok(())
    }

    /// Nodes from the root down to the leaf responsible for `key`.
    fn path_to_leaf(&self, key: &StoreKey) -> Result<Path, BTreeError> {
        let mut path = Vec::new();
        let mut id = self.superblock.root_block;
        loop {
            if path.len() > MAX_TREE_DEPTH {
                return Err(BTreeError::Corrupt(id));
            }
            let node = self.read_node(id)?;
            let next = match &node {
                Node::Internal(internal) => Some(
                    internal
                        .child(internal.child_index(key))
                        .ok_or(BTreeError::Corrupt(id))?,
                ),
                Node::Leaf(_) => None,
            };
            path.push((id, node));
            match next {
                Some(child) => id = child,
                None => return Ok(path),
            }
        }
    }

    /// Write `node` back, splitting it (and then its ancestors) while it
    /// does not fit in a block.
    fn store_with_splits(
        &mut self,
        mut path: Path,
        mut id: BlockId,
        mut node: Node,
    ) -> Result<(), BTreeError> {
        loop {
            if node::fits(&self.sizer, &node) {
                return self.write_node(id, &node);
            }

            let (right, median) = node::split(&self.sizer, &mut node)?;
            let right_id = self.cache.allocate();
            self.write_node(id, &node)?;
            self.write_node(right_id, &right)?;

            match path.pop() {
                Some((parent_id, mut parent)) => {
                    parent
                        .as_internal_mut()
                        .ok_or(BTreeError::Corrupt(parent_id))?
                        .insert(median, right_id);
                    id = parent_id;
                    node = parent;
                }
                None => {
                    let root = self.cache.allocate();
                    let new_root =
                        Node::Internal(InternalNode::with_children(id, median, right_id));
                    self.write_node(root, &new_root)?;
                    self.superblock.root_block = root;
                    return self.write_superblock();
                }
            }
        }
    }

    /// Write `node` back, merging or leveling it with a sibling (and then
    /// fixing its ancestors) while it is underfull.
    fn rebalance(
        &mut self,
        mut path: Path,
        mut id: BlockId,
        mut node: Node,
    ) -> Result<(), BTreeError> {
        loop {
            let Some((parent_id, mut parent_node)) = path.pop() else {
                return self.store_root(id, node);
            };
            if !node::is_underfull(&self.sizer, &node) {
                return self.write_node(id, &node);
            }

            let parent = parent_node
                .as_internal_mut()
                .ok_or(BTreeError::Corrupt(parent_id))?;
            let index = parent
                .index_of_child(id)
                .ok_or(BTreeError::Corrupt(parent_id))?;
            if parent.npairs() < 2 {
                self.write_node(id, &node)?;
                id = parent_id;
                node = parent_node;
                continue;
            }

            let node_is_left = index + 1 < parent.npairs();
            let right_index = if node_is_left { index + 1 } else { index };
            let sibling_index = if node_is_left { index + 1 } else { index - 1 };
            let view = parent
                .separator_view(right_index)
                .ok_or(BTreeError::Corrupt(parent_id))?;
            let sibling_id = parent
                .child(sibling_index)
                .ok_or(BTreeError::Corrupt(parent_id))?;
            let sibling = self.read_node(sibling_id)?;

            let (left_id, right_id) = if node_is_left {
                (id, sibling_id)
            } else {
                (sibling_id, id)
            };
            let (mut left, right) = if node_is_left {
                (node, sibling)
            } else {
                (sibling, node)
            };

            if node::is_mergable(&self.sizer, &left, &right, &view) {
                node::merge(&self.sizer, &mut left, right, &view)?;
                self.write_node(left_id, &left)?;
                self.cache.free(right_id)?;
                parent.remove(right_index);
            } else {
                let mut right = right;
                let (receiver, donor, side) = if node_is_left {
                    (&mut left, &mut right, SiblingSide::Right)
                } else {
                    (&mut right, &mut left, SiblingSide::Left)
                };
                if let Some(separator) = node::level(&self.sizer, receiver, donor, side, &view)? {
                    parent.set_key(right_index, separator);
                }
                self.write_node(left_id, &left)?;
                self.write_node(right_id, &right)?;
            }

            id = parent_id;
            node = parent_node;
        }
    }

    /// Write the root back, replacing it by its only child while it is an
    /// internal node with a single pair.
    fn store_root(&mut self, mut id: BlockId, mut node: Node) -> Result<(), BTreeError> {
        let mut collapsed = false;
        while let Some(child) = node
            .as_internal()
            .filter(|internal| internal.npairs() == 1)
            .and_then(|internal| internal.child(0))
        {
            self.cache.free(id)?;
            id = child;
            node = self.read_node(child)?;
            collapsed = true;
        }

        if collapsed {
            self.superblock.root_block = id;
            self.write_superblock()?;
            Ok(())
        } else {
            self.write_node(id, &node)
        }
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    Cache(BlockCacheError),
    Node(NodeError),
    Superblock(SuperblockError),
    /// The superblock has no root.
    MissingRoot,
    /// A node's structure contradicts its position in the tree.
    Corrupt(BlockId),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Node(e) => write!(f, "node error: {e}"),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
            Self::MissingRoot => write!(f, "tree has no root"),
            Self::Corrupt(id) => write!(f, "block {id} is corrupt"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(e) => Some(e),
            Self::Node(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::MissingRoot | Self::Corrupt(_) => None,
        }
    }
}

impl From<BlockCacheError> for BTreeError {
    fn from(e: BlockCacheError) -> Self {
        Self::Cache(e)
    }
}

impl From<NodeError> for BTreeError {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl From<SuperblockError> for BTreeError {
    fn from(e: SuperblockError) -> Self {
        Self::Superblock(e)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::storage::block::BlockSize;
    use crate::storage::btree::sizer::{FixedValueSizer, MemcachedValue, MemcachedValueSizer};

    const VALUE_SIZE: usize = 24;

    fn small_tree() -> BTree<FixedValueSizer> {
        let sizer =
            FixedValueSizer::new(VALUE_SIZE, BlockSize::new(512).expect("valid block size"));
        BTree::create(BlockCache::new(), sizer).expect("should create tree")
    }

    fn key(i: usize) -> StoreKey {
        StoreKey::new(format!("key{i:05}")).expect("short key")
    }

    fn value(i: usize) -> Vec<u8> {
        let mut value = vec![0u8; VALUE_SIZE];
        value[..8].copy_from_slice(&(i as u64).to_le_bytes());
        value
    }

    #[test]
    fn test_empty_tree() {
        let tree = small_tree();
        assert_eq!(tree.population().expect("population"), 0);
        assert_eq!(tree.depth().expect("depth"), 1);
        assert!(tree.get(&key(1)).expect("get").is_none());
        tree.validate_all().expect("empty tree is valid");
    }

    #[test]
    fn test_set_get_replace() {
        let mut tree = small_tree();
        assert!(tree.set(key(1), value(1), ReplTimestamp::new(10)).expect("set").is_none());
        let old = tree.set(key(1), value(2), ReplTimestamp::new(11)).expect("set");

        assert_eq!(old, Some(value(1)));
        let pair = tree.get(&key(1)).expect("get").expect("present");
        assert_eq!(pair.value, value(2));
        assert_eq!(pair.timestamp, ReplTimestamp::new(11));
        assert_eq!(tree.population().expect("population"), 1);
    }

    #[test]
    fn test_rejects_malformed_value() {
        let mut tree = small_tree();
        let result = tree.set(key(1), vec![0; VALUE_SIZE - 1], ReplTimestamp::new(1));
        assert!(matches!(
            result,
            Err(BTreeError::Node(NodeError::Value(ValueError::Malformed)))
        ));
    }

    #[test]
    fn test_many_inserts_split_and_stay_valid() {
        let mut tree = small_tree();
        let mut order: Vec<usize> = (0..600).collect();
        order.shuffle(&mut StdRng::seed_from_u64(7));

        for &i in &order {
            tree.set(key(i), value(i), ReplTimestamp::new(i as u64)).expect("set");
        }

        tree.validate_all().expect("tree should validate");
        assert!(tree.depth().expect("depth") >= 3);
        assert_eq!(tree.population().expect("population"), 600);
        for i in 0..600 {
            let pair = tree.get(&key(i)).expect("get").expect("present");
            assert_eq!(pair.value, value(i));
        }
    }

    #[test]
    fn test_deletes_merge_and_collapse_root() {
        let mut tree = small_tree();
        let mut rng = StdRng::seed_from_u64(11);
        let mut order: Vec<usize> = (0..400).collect();
        order.shuffle(&mut rng);
        for &i in &order {
            tree.set(key(i), value(i), ReplTimestamp::new(1)).expect("set");
        }

        order.shuffle(&mut rng);
        for (n, &i) in order.iter().enumerate() {
            let removed = tree.delete(&key(i), ReplTimestamp::new(2)).expect("delete");
            assert_eq!(removed, Some(value(i)));
            if n % 50 == 0 {
                tree.validate_all().expect("tree should stay valid while shrinking");
            }
        }

        tree.validate_all().expect("empty tree should validate");
        assert_eq!(tree.population().expect("population"), 0);
        assert_eq!(tree.depth().expect("depth"), 1);
        // superblock, statblock and the root leaf
        assert_eq!(tree.cache().allocated_count(), 3);
    }

    #[test]
    fn test_delete_missing_key_is_noop() {
        let mut tree = small_tree();
        tree.set(key(1), value(1), ReplTimestamp::new(1)).expect("set");
        assert!(tree.delete(&key(2), ReplTimestamp::new(2)).expect("delete").is_none());
        assert_eq!(tree.population().expect("population"), 1);
    }

    #[test]
    fn test_backfill_replays_changes_since() {
        let mut tree = small_tree();
        for i in 0..5 {
            tree.set(key(i), value(i), ReplTimestamp::new(100 + i as u64)).expect("set");
        }
        tree.delete(&key(0), ReplTimestamp::new(110)).expect("delete");
        tree.delete(&key(1), ReplTimestamp::new(90)).expect("delete");

        let mut atoms = Vec::new();
        tree.backfill(ReplTimestamp::new(103), &mut |atom| {
            atoms.push(atom);
            ControlFlow::Continue(())
        })
        .expect("backfill");

        let summary: Vec<(String, u64)> = atoms
            .iter()
            .map(|atom| (atom.key().to_string(), atom.timestamp().time()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("key00003".to_string(), 103),
                ("key00004".to_string(), 104),
                ("key00000".to_string(), 110),
            ]
        );
        assert!(matches!(atoms[2], BackfillAtom::Delete { .. }));
    }

    #[test]
    fn test_forget_deletions_before_horizon() {
        let mut tree = small_tree();
        for i in 0..4 {
            tree.set(key(i), value(i), ReplTimestamp::new(10)).expect("set");
        }
        for i in 0..4 {
            tree.delete(&key(i), ReplTimestamp::new(20 + i as u64)).expect("delete");
        }
        assert_eq!(tree.deletion_count(), 4);

        assert_eq!(tree.forget_deletions_before(ReplTimestamp::new(22)), 2);
        assert_eq!(tree.deletion_count(), 2);

        let mut deleted = Vec::new();
        tree.backfill(ReplTimestamp::DISTANT_PAST, &mut |atom| {
            deleted.push(atom.key().to_string());
            ControlFlow::Continue(())
        })
        .expect("backfill");
        assert_eq!(deleted, vec!["key00002".to_string(), "key00003".to_string()]);
    }

    #[test]
    fn test_backfill_stops_when_visitor_breaks() {
        let mut tree = small_tree();
        for i in 0..50 {
            tree.set(key(i), value(i), ReplTimestamp::new(1)).expect("set");
        }
        let mut seen = 0;
        tree.backfill(ReplTimestamp::DISTANT_PAST, &mut |_| {
            seen += 1;
            if seen == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
        .expect("backfill");
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_reset_deletion_record_on_rewrite() {
        let mut tree = small_tree();
        tree.set(key(1), value(1), ReplTimestamp::new(1)).expect("set");
        tree.delete(&key(1), ReplTimestamp::new(2)).expect("delete");
        tree.set(key(1), value(3), ReplTimestamp::new(3)).expect("set");

        let mut atoms = Vec::new();
        tree.backfill(ReplTimestamp::DISTANT_PAST, &mut |atom| {
            atoms.push(atom);
            ControlFlow::Continue(())
        })
        .expect("backfill");
        assert_eq!(atoms.len(), 1);
        assert!(matches!(atoms[0], BackfillAtom::Set { .. }));
    }

    #[test]
    fn test_reopen_from_cache() {
        let mut tree = BTree::create(BlockCache::new(), MemcachedValueSizer).expect("create");
        let encoded = MemcachedValue::new(b"v".to_vec(), 1, 2).encode().expect("encode");
        tree.set(StoreKey::try_from("k").expect("key"), encoded.clone(), ReplTimestamp::new(5))
            .expect("set");
        tree.set_metainfo(b"meta").expect("metainfo");

        let reopened = BTree::open(tree.into_cache(), MemcachedValueSizer).expect("open");
        let pair = reopened
            .get(&StoreKey::try_from("k").expect("key"))
            .expect("get")
            .expect("present");
        assert_eq!(pair.value, encoded);
        assert_eq!(&reopened.superblock().metainfo()[..4], b"meta");
        assert_eq!(reopened.population().expect("population"), 1);
    }

    #[test]
    fn test_open_rejects_blank_cache() {
        let result = BTree::open(BlockCache::new(), MemcachedValueSizer);
        assert!(matches!(result, Err(BTreeError::Superblock(_))));
    }
}
