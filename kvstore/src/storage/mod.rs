//! Block-structured node store.
//!
//! # Layout
//!
//! - Block 0: superblock (root, statblock and secondary-index block ids,
//!   metainfo blob)
//! - Statblock: key population
//! - Remaining blocks: B-tree nodes
//!
//! Blocks live in an in-memory [`BlockCache`].

mod block;
pub mod btree;
mod cache;
mod superblock;

pub use block::{
    BLOCK_SIZE, Block, BlockId, BlockMagic, BlockSize, MIN_BLOCK_SIZE, NULL_BLOCK_ID,
    SUPERBLOCK_ID,
};
pub use cache::{BlockCache, BlockCacheError};
pub use superblock::{
    METAINFO_BLOB_MAXREFLEN, STATBLOCK_MAGIC, SUPERBLOCK_MAGIC, Statblock, Superblock,
    SuperblockError,
};
