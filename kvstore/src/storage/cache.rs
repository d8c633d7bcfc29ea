//! In-memory block cache backing a node store.
//!
//! Blocks are addressed by [`BlockId`]. Block 0 is reserved for the superblock
//! and is allocated when the cache is created. Freed ids are recycled before
//! new ones are handed out.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::block::{Block, BlockId, SUPERBLOCK_ID};

#[derive(Debug)]
pub struct BlockCache {
    blocks: Vec<Option<Block>>,
    free_list: Vec<BlockId>,
}

impl BlockCache {
    /// Create a cache with only the (zeroed) superblock allocated.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: vec![Some(Block::new())],
            free_list: Vec::new(),
        }
    }

    /// Allocate a zeroed block.
    pub fn allocate(&mut self) -> BlockId {
        if let Some(id) = self.free_list.pop() {
            self.blocks[id as usize] = Some(Block::new());
            return id;
        }
        self.blocks.push(Some(Block::new()));
        (self.blocks.len() - 1) as BlockId
    }

    pub fn read(&self, id: BlockId) -> Result<&Block, BlockCacheError> {
        self.blocks
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(BlockCacheError::UnknownBlock(id))
    }

    pub fn write(&mut self, id: BlockId, block: Block) -> Result<(), BlockCacheError> {
        let slot = self
            .blocks
            .get_mut(id as usize)
            .filter(|slot| slot.is_some())
            .ok_or(BlockCacheError::UnknownBlock(id))?;
        *slot = Some(block);
        Ok(())
    }

    /// Release a block. The superblock cannot be freed.
    pub fn free(&mut self, id: BlockId) -> Result<(), BlockCacheError> {
        if id == SUPERBLOCK_ID {
            return Err(BlockCacheError::ReservedBlock(id));
        }
        let slot = self
            .blocks
            .get_mut(id as usize)
            .filter(|slot| slot.is_some())
            .ok_or(BlockCacheError::UnknownBlock(id))?;
        *slot = None;
        self.free_list.push(id);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, id: BlockId) -> bool {
        self.blocks.get(id as usize).is_some_and(Option::is_some)
    }

    /// Number of allocated blocks, superblock included.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.blocks.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCacheError {
    /// The id was never allocated or has been freed.
    UnknownBlock(BlockId),
    /// The id is reserved and cannot be freed.
    ReservedBlock(BlockId),
}

impl std::fmt::Display for BlockCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownBlock(id) => write!(f, "block {id} is not allocated"),
            Self::ReservedBlock(id) => write!(f, "block {id} is reserved"),
        }
    }
}

impl std::error::Error for BlockCacheError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_is_preallocated() {
        let cache = BlockCache::new();
        assert!(cache.is_allocated(SUPERBLOCK_ID));
        assert_eq!(cache.allocated_count(), 1);
    }

    #[test]
    fn test_allocate_write_read() {
        let mut cache = BlockCache::new();
        let id = cache.allocate();
        assert_eq!(id, 1);

        let mut block = Block::new();
        block.write_u64(8, 77);
        cache.write(id, block).expect("should write");
        assert_eq!(cache.read(id).expect("should read").read_u64(8), 77);
    }

    #[test]
    fn test_free_recycles_ids() {
        let mut cache = BlockCache::new();
        let a = cache.allocate();
        let _b = cache.allocate();
        cache.free(a).expect("should free");

        assert!(!cache.is_allocated(a));
        assert_eq!(cache.read(a).err(), Some(BlockCacheError::UnknownBlock(a)));
        assert_eq!(cache.free(a), Err(BlockCacheError::UnknownBlock(a)));

        let reused = cache.allocate();
        assert_eq!(reused, a);
        assert_eq!(cache.read(reused).expect("should read").read_u64(0), 0);
    }

    #[test]
    fn test_superblock_cannot_be_freed() {
        let mut cache = BlockCache::new();
        assert_eq!(
            cache.free(SUPERBLOCK_ID),
            Err(BlockCacheError::ReservedBlock(SUPERBLOCK_ID))
        );
    }
}
