//! Streamed values.
//!
//! A [`DataProvider`] announces its total size up front and then delivers the
//! bytes as a stream of chunks. It can be consumed exactly once.
//!
//! A mutation's value has to reach two consumers: the local store and the
//! replica stream. [`BufferBorrowingProvider::split`] reads the original once
//! on a background task and buffers every chunk for both sides, so a slow
//! network path never stalls the local one (or vice versa).

use std::fmt;

use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream};

pub type Chunk = Result<Vec<u8>, DataError>;

pub struct DataProvider {
    size: usize,
    chunks: BoxStream<'static, Chunk>,
}

impl DataProvider {
    /// A provider whose whole value is already in memory.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len(),
            chunks: stream::once(async move { Ok(bytes) }).boxed(),
        }
    }

    /// A provider over an arbitrary chunk stream announced as `size` bytes.
    pub fn from_stream(
        size: usize,
        chunks: impl futures::Stream<Item = Chunk> + Send + 'static,
    ) -> Self {
        Self {
            size,
            chunks: chunks.boxed(),
        }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    pub async fn next_chunk(&mut self) -> Option<Chunk> {
        self.chunks.next().await
    }

    /// Collect every chunk, checking the total against the announced size.
    pub async fn read_all(mut self) -> Result<Vec<u8>, DataError> {
        let mut bytes = Vec::with_capacity(self.size);
        while let Some(chunk) = self.chunks.next().await {
            bytes.extend_from_slice(&chunk?);
            if bytes.len() > self.size {
                return Err(DataError::SizeMismatch {
                    expected: self.size,
                    actual: bytes.len(),
                });
            }
        }
        if bytes.len() != self.size {
            return Err(DataError::SizeMismatch {
                expected: self.size,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }
}

impl fmt::Debug for DataProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProvider")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Tees one provider into two independently consumable copies.
pub struct BufferBorrowingProvider;

impl BufferBorrowingProvider {
    /// Returns `(local, side)`. Must be called inside a tokio runtime.
    ///
    /// Chunks are buffered without bound, so either copy may be read at any
    /// pace or dropped without affecting the other.
    #[must_use]
    pub fn split(source: DataProvider) -> (DataProvider, DataProvider) {
        let size = source.size();
        let (local_tx, local_rx) = mpsc::unbounded();
        let (side_tx, side_rx) = mpsc::unbounded();

        tokio::spawn(async move {
            let mut source = source;
            while let Some(chunk) = source.next_chunk().await {
                // A dropped consumer just stops receiving.
                let _ = local_tx.unbounded_send(chunk.clone());
                let _ = side_tx.unbounded_send(chunk);
            }
        });

        (
            DataProvider::from_stream(size, local_rx),
            DataProvider::from_stream(size, side_rx),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// The stream delivered a different number of bytes than announced.
    SizeMismatch { expected: usize, actual: usize },
    /// The underlying source failed.
    Source(String),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch { expected, actual } => {
                write!(f, "value announced {expected} bytes but delivered {actual}")
            }
            Self::Source(message) => write!(f, "value source failed: {message}"),
        }
    }
}

impl std::error::Error for DataError {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn chunked(parts: &[&[u8]]) -> DataProvider {
        let size = parts.iter().map(|p| p.len()).sum();
        let chunks: Vec<Chunk> = parts.iter().map(|p| Ok(p.to_vec())).collect();
        DataProvider::from_stream(size, stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_read_all_concatenates_chunks() {
        let provider = chunked(&[b"hel", b"lo ", b"world"]);
        assert_eq!(provider.size(), 11);
        assert_eq!(provider.read_all().await, Ok(b"hello world".to_vec()));
    }

    #[tokio::test]
    async fn test_read_all_detects_size_mismatch() {
        let short = DataProvider::from_stream(10, stream::iter(vec![Ok(b"abc".to_vec())]));
        assert_eq!(
            short.read_all().await,
            Err(DataError::SizeMismatch {
                expected: 10,
                actual: 3
            })
        );

        let long = DataProvider::from_stream(2, stream::iter(vec![Ok(b"abc".to_vec())]));
        assert!(long.read_all().await.is_err());
    }

    #[tokio::test]
    async fn test_read_all_propagates_source_error() {
        let failing = DataProvider::from_stream(
            4,
            stream::iter(vec![
                Ok(b"ab".to_vec()),
                Err(DataError::Source("connection reset".to_string())),
            ]),
        );
        assert_eq!(
            failing.read_all().await,
            Err(DataError::Source("connection reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_split_delivers_same_bytes_to_both_sides() {
        let (local, side) = BufferBorrowingProvider::split(chunked(&[b"abc", b"def"]));
        assert_eq!(local.size(), 6);
        assert_eq!(side.size(), 6);

        // Drain the side copy first; the local copy must still be complete.
        assert_eq!(side.read_all().await, Ok(b"abcdef".to_vec()));
        assert_eq!(local.read_all().await, Ok(b"abcdef".to_vec()));
    }

    #[tokio::test]
    async fn test_split_reads_source_once() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let source = stream::iter(vec![b"x".to_vec(), b"y".to_vec()]).map(move |chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(chunk)
        });
        let (local, side) = BufferBorrowingProvider::split(DataProvider::from_stream(2, source));

        assert_eq!(local.read_all().await, Ok(b"xy".to_vec()));
        assert_eq!(side.read_all().await, Ok(b"xy".to_vec()));
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropping_one_side_does_not_block_the_other() {
        let (local, side) = BufferBorrowingProvider::split(chunked(&[b"only"]));
        drop(side);
        assert_eq!(local.read_all().await, Ok(b"only".to_vec()));
    }
}
