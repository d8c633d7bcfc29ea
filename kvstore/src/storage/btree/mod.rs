//! B-tree node store.
//!
//! # Structure
//!
//! - Internal nodes: `(key, child)` pairs, pair 0 keyed by the empty key
//! - Leaf nodes: `(key, value)` pairs stamped with replication timestamps
//!
//! Node algorithms are parameterized by a [`ValueSizer`], the only component
//! that understands value encodings.
//!
//! # Usage
//!
//! ```
//! use kvstore::storage::BlockCache;
//! use kvstore::storage::btree::{BTree, MemcachedValue, MemcachedValueSizer, StoreKey};
//! use kvstore::timestamp::ReplTimestamp;
//!
//! let mut tree = BTree::create(BlockCache::new(), MemcachedValueSizer).unwrap();
//! let key = StoreKey::try_from("greeting").unwrap();
//! let value = MemcachedValue::new(b"hello".to_vec(), 0, 0).encode().unwrap();
//!
//! tree.set(key.clone(), value.clone(), ReplTimestamp::new(1)).unwrap();
//! assert_eq!(tree.get(&key).unwrap().map(|pair| pair.value), Some(value));
//! ```

mod internal;
mod key;
mod leaf;
pub mod node;
mod sizer;
mod tree;

pub use internal::{InternalNode, InternalPair};
pub use key::{KeyError, MAX_KEY_SIZE, StoreKey};
pub use leaf::{LeafNode, LeafPair};
pub use node::{INTERNAL_MAGIC, Node, NodeError, SiblingSide};
pub use sizer::{
    FIXED_LEAF_MAGIC, FixedValueSizer, MAX_INLINE_VALUE_SIZE, MEMCACHED_LEAF_MAGIC, MemcachedValue,
    MemcachedValueSizer, ValueError, ValueSizer,
};
pub use tree::{BTree, BTreeError, BackfillAtom};
