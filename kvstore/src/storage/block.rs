//! Block types and constants for the node store.
//!
//! A block is the fixed-size unit every B-tree node, the superblock and the
//! statblock are serialized into. All multi-byte fields are little-endian.

/// Size of a cache block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// A block identifier.
pub type BlockId = u64;

/// The superblock always lives at block 0.
pub const SUPERBLOCK_ID: BlockId = 0;

/// Marks "no block". Block 0 is the superblock, so it can never be a node.
pub const NULL_BLOCK_ID: BlockId = SUPERBLOCK_ID;

/// Four-byte tag at the start of every block identifying its kind.
pub type BlockMagic = [u8; 4];

/// Smallest usable block size for a node store.
pub const MIN_BLOCK_SIZE: usize = 256;

/// The usable size of a block for node algorithms.
///
/// A node store may use less than [`BLOCK_SIZE`] of each block; the value
/// sizer decides how much.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockSize(usize);

impl BlockSize {
    pub const DEFAULT: Self = Self(BLOCK_SIZE);

    /// Returns `None` unless `MIN_BLOCK_SIZE <= bytes <= BLOCK_SIZE`.
    #[must_use]
    pub const fn new(bytes: usize) -> Option<Self> {
        if bytes < MIN_BLOCK_SIZE || bytes > BLOCK_SIZE {
            None
        } else {
            Some(Self(bytes))
        }
    }

    #[must_use]
    pub const fn value(self) -> usize {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A raw block buffer.
#[derive(Clone)]
pub struct Block {
    data: Box<[u8; BLOCK_SIZE]>,
}

impl Block {
    /// Create a new zeroed block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; BLOCK_SIZE]),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.data
    }

    /// The block's magic tag.
    #[must_use]
    pub fn magic(&self) -> BlockMagic {
        [self.data[0], self.data[1], self.data[2], self.data[3]]
    }

    pub fn set_magic(&mut self, magic: BlockMagic) {
        self.write_bytes(0, &magic);
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Bounds-checked read, for decoding blocks that may be corrupt.
    #[must_use]
    pub fn get_bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.data.get(offset..end)
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("magic", &String::from_utf8_lossy(&self.magic()))
            .field("first_16_bytes", &&self.data[..16])
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_read_write() {
        let mut block = Block::new();

        block.set_magic(*b"test");
        assert_eq!(&block.magic(), b"test");

        block.write_u16(10, 0xBEEF);
        assert_eq!(block.read_u16(10), 0xBEEF);

        block.write_u64(200, 0x0102_0304_0506_0708);
        assert_eq!(block.read_u64(200), 0x0102_0304_0506_0708);
        assert_eq!(block.read_u8(200), 0x08);

        block.write_bytes(500, b"hello");
        assert_eq!(block.read_bytes(500, 5), b"hello");
    }

    #[test]
    fn test_get_bytes_rejects_out_of_range() {
        let block = Block::new();
        assert!(block.get_bytes(BLOCK_SIZE - 4, 4).is_some());
        assert!(block.get_bytes(BLOCK_SIZE - 4, 5).is_none());
        assert!(block.get_bytes(usize::MAX, 2).is_none());
    }

    #[test]
    fn test_block_size_bounds() {
        assert_eq!(BlockSize::new(512).map(BlockSize::value), Some(512));
        assert!(BlockSize::new(MIN_BLOCK_SIZE - 1).is_none());
        assert!(BlockSize::new(BLOCK_SIZE + 1).is_none());
        assert_eq!(BlockSize::default().value(), BLOCK_SIZE);
    }
}
