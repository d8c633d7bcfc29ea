//! Value sizers.
//!
//! Node algorithms never interpret values themselves. They ask a
//! [`ValueSizer`] how long a serialized value is, whether a value fits in the
//! space left on a block, and what block size and leaf magic to use. One
//! implementation exists per value encoding.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::block::{BlockMagic, BlockSize};

/// Capability object describing one value encoding.
pub trait ValueSizer: Send + Sync {
    /// Serialized length of the value starting at `value[0]`.
    ///
    /// Only meaningful once [`fits`](Self::fits) has returned true.
    fn size(&self, value: &[u8]) -> usize;

    /// Whether a well-formed value starts at `value[0]` and fits within
    /// `length_available` bytes.
    fn fits(&self, value: &[u8], length_available: usize) -> bool;

    /// Upper bound on [`size`](Self::size) for this encoding.
    fn max_possible_size(&self) -> usize;

    /// Block size node algorithms should assume.
    fn default_block_size(&self) -> BlockSize;

    /// Magic tag identifying leaves that hold this encoding.
    fn leaf_magic(&self) -> BlockMagic;
}

/// Largest memcached payload stored inline in a leaf.
pub const MAX_INLINE_VALUE_SIZE: usize = 512;

pub const MEMCACHED_LEAF_MAGIC: BlockMagic = *b"leaf";

/// Memcached value header: `data_len` u16, flags u32, exptime u32, cas u64.
pub const MEMCACHED_VALUE_HEADER_SIZE: usize = 18;

/// A memcached value: opaque data plus client flags, expiry and CAS.
///
/// A `cas` of zero means no CAS has been assigned yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemcachedValue {
    pub flags: u32,
    pub exptime: u32,
    pub cas: u64,
    pub data: Vec<u8>,
}

impl MemcachedValue {
    #[must_use]
    pub const fn new(data: Vec<u8>, flags: u32, exptime: u32) -> Self {
        Self {
            flags,
            exptime,
            cas: 0,
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ValueError> {
        if self.data.len() > MAX_INLINE_VALUE_SIZE {
            return Err(ValueError::TooLarge(self.data.len()));
        }
        let mut bytes = Vec::with_capacity(MEMCACHED_VALUE_HEADER_SIZE + self.data.len());
        bytes.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.exptime.to_le_bytes());
        bytes.extend_from_slice(&self.cas.to_le_bytes());
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValueError> {
        let sizer = MemcachedValueSizer;
        if !sizer.fits(bytes, bytes.len()) || sizer.size(bytes) != bytes.len() {
            return Err(ValueError::Malformed);
        }
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&bytes[2..6]);
        let mut exptime = [0u8; 4];
        exptime.copy_from_slice(&bytes[6..10]);
        let mut cas = [0u8; 8];
        cas.copy_from_slice(&bytes[10..18]);

        Ok(Self {
            flags: u32::from_le_bytes(flags),
            exptime: u32::from_le_bytes(exptime),
            cas: u64::from_le_bytes(cas),
            data: bytes[MEMCACHED_VALUE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Sizer for [`MemcachedValue`] encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemcachedValueSizer;

impl MemcachedValueSizer {
    fn data_len(value: &[u8]) -> Option<usize> {
        let len = value.get(0..2)?;
        Some(usize::from(u16::from_le_bytes([len[0], len[1]])))
    }
}

impl ValueSizer for MemcachedValueSizer {
    fn size(&self, value: &[u8]) -> usize {
        MEMCACHED_VALUE_HEADER_SIZE + Self::data_len(value).unwrap_or(0)
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        let Some(data_len) = Self::data_len(value) else {
            return false;
        };
        let size = MEMCACHED_VALUE_HEADER_SIZE + data_len;
        data_len <= MAX_INLINE_VALUE_SIZE && size <= length_available && size <= value.len()
    }

    fn max_possible_size(&self) -> usize {
        MEMCACHED_VALUE_HEADER_SIZE + MAX_INLINE_VALUE_SIZE
    }

    fn default_block_size(&self) -> BlockSize {
        BlockSize::DEFAULT
    }

    fn leaf_magic(&self) -> BlockMagic {
        MEMCACHED_LEAF_MAGIC
    }
}

pub const FIXED_LEAF_MAGIC: BlockMagic = *b"fixd";

/// Sizer for fixed-width values on a configurable block size.
///
/// Used to exercise node algorithms on small blocks.
#[derive(Debug, Clone, Copy)]
pub struct FixedValueSizer {
    value_size: usize,
    block_size: BlockSize,
}

impl FixedValueSizer {
    #[must_use]
    pub const fn new(value_size: usize, block_size: BlockSize) -> Self {
        Self {
            value_size,
            block_size,
        }
    }
}

impl ValueSizer for FixedValueSizer {
    fn size(&self, _value: &[u8]) -> usize {
        self.value_size
    }

    fn fits(&self, value: &[u8], length_available: usize) -> bool {
        value.len() >= self.value_size && length_available >= self.value_size
    }

    fn max_possible_size(&self) -> usize {
        self.value_size
    }

    fn default_block_size(&self) -> BlockSize {
        self.block_size
    }

    fn leaf_magic(&self) -> BlockMagic {
        FIXED_LEAF_MAGIC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    /// Payload exceeds the inline limit.
    TooLarge(usize),
    /// Bytes do not hold a well-formed value.
    Malformed,
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooLarge(len) => {
                write!(f, "value of {len} bytes exceeds {MAX_INLINE_VALUE_SIZE} bytes")
            }
            Self::Malformed => write!(f, "malformed value"),
        }
    }
}

impl std::error::Error for ValueError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memcached_value_roundtrip() {
        let mut value = MemcachedValue::new(b"payload".to_vec(), 0xF1A6, 60);
        value.cas = 99;

        let bytes = value.encode().expect("should encode");
        assert_eq!(MemcachedValueSizer.size(&bytes), bytes.len());
        assert_eq!(MemcachedValue::decode(&bytes).expect("should decode"), value);
    }

    #[test]
    fn test_memcached_sizer_fits() {
        let sizer = MemcachedValueSizer;
        let bytes = MemcachedValue::new(vec![7; 10], 0, 0)
            .encode()
            .expect("should encode");

        assert!(sizer.fits(&bytes, 28));
        assert!(!sizer.fits(&bytes, 27));
        assert!(!sizer.fits(&bytes[..20], 100));
        assert!(!sizer.fits(&bytes[..1], 100));
    }

    #[test]
    fn test_memcached_rejects_oversized_payload() {
        let value = MemcachedValue::new(vec![0; MAX_INLINE_VALUE_SIZE + 1], 0, 0);
        assert_eq!(
            value.encode(),
            Err(ValueError::TooLarge(MAX_INLINE_VALUE_SIZE + 1))
        );

        let mut forged = vec![0u8; MEMCACHED_VALUE_HEADER_SIZE + 600];
        forged[..2].copy_from_slice(&600u16.to_le_bytes());
        assert!(!MemcachedValueSizer.fits(&forged, forged.len()));
    }

    #[test]
    fn test_fixed_sizer() {
        let block_size = BlockSize::new(512).expect("valid block size");
        let sizer = FixedValueSizer::new(16, block_size);

        assert_eq!(sizer.size(&[0; 16]), 16);
        assert!(sizer.fits(&[0; 20], 16));
        assert!(!sizer.fits(&[0; 15], 16));
        assert!(!sizer.fits(&[0; 16], 15));
        assert_eq!(sizer.default_block_size().value(), 512);
        assert_ne!(sizer.leaf_magic(), MemcachedValueSizer.leaf_magic());
    }
}
