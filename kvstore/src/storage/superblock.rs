//! Superblock and statblock of a node store.
//!
//! The superblock lives at [`SUPERBLOCK_ID`](super::block::SUPERBLOCK_ID) and
//! records where the tree root, the statblock and the secondary-index block
//! live, followed by an opaque metainfo blob that fills the rest of the block.
//!
//! Layout:
//! - magic: 4 bytes (`supe`)
//! - `root_block`: 8 bytes
//! - `stat_block`: 8 bytes
//! - `sindex_block`: 8 bytes
//! - metainfo blob: remainder of the block

use crate::storage::block::{BLOCK_SIZE, Block, BlockId, BlockMagic, NULL_BLOCK_ID};

pub const SUPERBLOCK_MAGIC: BlockMagic = *b"supe";
pub const STATBLOCK_MAGIC: BlockMagic = *b"stat";

/// Offsets for superblock fields.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const ROOT_BLOCK: usize = 4;
    pub const STAT_BLOCK: usize = 12;
    pub const SINDEX_BLOCK: usize = 20;
    pub const METAINFO_BLOB: usize = 28;

    pub const POPULATION: usize = 4;
}

/// Bytes left for the metainfo blob after the fixed superblock fields.
pub const METAINFO_BLOB_MAXREFLEN: usize = BLOCK_SIZE
    - std::mem::size_of::<BlockMagic>()
    - 3 * std::mem::size_of::<BlockId>();

const _: () = assert!(offsets::METAINFO_BLOB + METAINFO_BLOB_MAXREFLEN == BLOCK_SIZE);

/// The root record of a node store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub root_block: BlockId,
    pub stat_block: BlockId,
    pub sindex_block: BlockId,
    metainfo: Box<[u8; METAINFO_BLOB_MAXREFLEN]>,
}

impl Superblock {
    /// An empty superblock: no root, no statblock, zeroed metainfo.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root_block: NULL_BLOCK_ID,
            stat_block: NULL_BLOCK_ID,
            sindex_block: NULL_BLOCK_ID,
            metainfo: Box::new([0u8; METAINFO_BLOB_MAXREFLEN]),
        }
    }

    #[must_use]
    pub fn metainfo(&self) -> &[u8] {
        &self.metainfo[..]
    }

    /// Replace the metainfo blob; the unused tail is zeroed.
    pub fn set_metainfo(&mut self, blob: &[u8]) -> Result<(), SuperblockError> {
        if blob.len() > METAINFO_BLOB_MAXREFLEN {
            return Err(SuperblockError::MetainfoTooLarge(blob.len()));
        }
        self.metainfo.fill(0);
        self.metainfo[..blob.len()].copy_from_slice(blob);
        Ok(())
    }

    #[must_use]
    pub fn to_block(&self) -> Block {
        let mut block = Block::new();
        block.write_bytes(offsets::MAGIC, &SUPERBLOCK_MAGIC);
        block.write_u64(offsets::ROOT_BLOCK, self.root_block);
        block.write_u64(offsets::STAT_BLOCK, self.stat_block);
        block.write_u64(offsets::SINDEX_BLOCK, self.sindex_block);
        block.write_bytes(offsets::METAINFO_BLOB, &self.metainfo[..]);
        block
    }

    pub fn from_block(block: &Block) -> Result<Self, SuperblockError> {
        let magic = block.magic();
        if magic != SUPERBLOCK_MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let mut metainfo = Box::new([0u8; METAINFO_BLOB_MAXREFLEN]);
        metainfo.copy_from_slice(block.read_bytes(offsets::METAINFO_BLOB, METAINFO_BLOB_MAXREFLEN));

        Ok(Self {
            root_block: block.read_u64(offsets::ROOT_BLOCK),
            stat_block: block.read_u64(offsets::STAT_BLOCK),
            sindex_block: block.read_u64(offsets::SINDEX_BLOCK),
            metainfo,
        })
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

/// Store statistics, kept in their own block so population updates do not
/// rewrite the superblock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statblock {
    /// Number of live keys. Signed so a transiently negative delta is representable.
    pub population: i64,
}

impl Statblock {
    #[must_use]
    pub fn to_block(self) -> Block {
        let mut block = Block::new();
        block.write_bytes(offsets::MAGIC, &STATBLOCK_MAGIC);
        block.write_bytes(offsets::POPULATION, &self.population.to_le_bytes());
        block
    }

    pub fn from_block(block: &Block) -> Result<Self, SuperblockError> {
        let magic = block.magic();
        if magic != STATBLOCK_MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }
        let mut population = [0u8; 8];
        population.copy_from_slice(block.read_bytes(offsets::POPULATION, 8));
        Ok(Self {
            population: i64::from_le_bytes(population),
        })
    }
}

/// Errors that can occur when reading or updating a superblock.
#[derive(Debug, PartialEq, Eq)]
pub enum SuperblockError {
    InvalidMagic(BlockMagic),
    MetainfoTooLarge(usize),
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(f, "invalid magic: {:?}", String::from_utf8_lossy(magic))
            }
            Self::MetainfoTooLarge(len) => write!(
                f,
                "metainfo blob of {len} bytes exceeds {METAINFO_BLOB_MAXREFLEN} bytes"
            ),
        }
    }
}

impl std::error::Error for SuperblockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let mut sb = Superblock::new();
        sb.root_block = 5;
        sb.stat_block = 1;
        sb.sindex_block = 9;
        sb.set_metainfo(b"version=3").expect("should fit");

        let block = sb.to_block();
        let restored = Superblock::from_block(&block).expect("should parse");

        assert_eq!(restored, sb);
        assert_eq!(&restored.metainfo()[..9], b"version=3");
        assert!(restored.metainfo()[9..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_superblock_invalid_magic() {
        let mut block = Block::new();
        block.write_bytes(0, b"nope");

        let result = Superblock::from_block(&block);
        assert_eq!(result, Err(SuperblockError::InvalidMagic(*b"nope")));
    }

    #[test]
    fn test_metainfo_fills_rest_of_block() {
        let mut sb = Superblock::new();
        let blob = vec![0xAB; METAINFO_BLOB_MAXREFLEN];
        sb.set_metainfo(&blob).expect("exact fit should be accepted");

        let block = sb.to_block();
        assert_eq!(block.read_u8(BLOCK_SIZE - 1), 0xAB);

        let too_big = vec![0; METAINFO_BLOB_MAXREFLEN + 1];
        assert_eq!(
            sb.set_metainfo(&too_big),
            Err(SuperblockError::MetainfoTooLarge(METAINFO_BLOB_MAXREFLEN + 1))
        );
    }

    #[test]
    fn test_statblock_negative_population() {
        let stats = Statblock { population: -3 };
        let restored = Statblock::from_block(&stats.to_block()).expect("should parse");
        assert_eq!(restored.population, -3);
    }
}
