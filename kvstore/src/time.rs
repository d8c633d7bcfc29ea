//! Time source abstraction.
//!
//! Replication timestamps are derived from wall-clock milliseconds. This module
//! provides a `TimeSource` trait so production code reads the system clock while
//! tests drive a manual clock and get deterministic timestamps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over wall-clock reads.
///
/// Implementations must be shareable across the shard workers, hence the
/// `Send + Sync` bound.
pub trait TimeSource: Send + Sync {
    /// Get the current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Box<T> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Real time source using system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[allow(clippy::cast_possible_truncation)] // u64 milliseconds last for millions of years
    fn now_ms(&self) -> u64 {
        // duration_since(UNIX_EPOCH) only fails if system time is before 1970.
        #[allow(clippy::expect_used)]
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch");
        duration.as_millis() as u64
    }
}

/// A manually driven time source.
///
/// Time only moves when a test calls [`advance`](Self::advance) or
/// [`set`](Self::set). Backed by an atomic so it can be shared with shard
/// workers running on other threads.
///
/// # Example
///
/// ```
/// use kvstore::time::{ManualTimeSource, TimeSource};
///
/// let time = ManualTimeSource::new(1000);
/// assert_eq!(time.now_ms(), 1000);
///
/// time.advance(100);
/// assert_eq!(time.now_ms(), 1100);
/// ```
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    current_time_ms: AtomicU64,
}

impl ManualTimeSource {
    #[must_use]
    pub const fn new(initial_time_ms: u64) -> Self {
        Self {
            current_time_ms: AtomicU64::new(initial_time_ms),
        }
    }

    /// Advance time by the given number of milliseconds, saturating at `u64::MAX`.
    pub fn advance(&self, ms: u64) {
        let _ = self
            .current_time_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(ms))
            });
    }

    /// Set the current time. This may move time backwards; the replication
    /// clock never issues a smaller timestamp than one it already issued.
    pub fn set(&self, time_ms: u64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_source() {
        let source = SystemTimeSource;
        let t1 = source.now_ms();
        let t2 = source.now_ms();

        // Time should be reasonable (after 2020)
        assert!(t1 > 1_577_836_800_000);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_manual_time_source_advances_and_saturates() {
        let source = ManualTimeSource::new(u64::MAX - 5);
        source.advance(3);
        assert_eq!(source.now_ms(), u64::MAX - 2);

        source.advance(100);
        assert_eq!(source.now_ms(), u64::MAX);
    }

    #[test]
    fn test_manual_time_source_through_arc() {
        let source: Arc<dyn TimeSource> = Arc::new(ManualTimeSource::new(42));
        assert_eq!(source.now_ms(), 42);
    }
}
