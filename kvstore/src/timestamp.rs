//! Replication timestamps and the clock that issues them.
//!
//! Every mutation is stamped with a [`ReplTimestamp`] (millisecond-resolution
//! logical time) and a proposed CAS value. Stamps come from a single shared
//! [`Timestamper`] so that the order in which mutations are handed to the
//! replication master matches the order of their timestamps.
//!
//! # Guarantees
//!
//! - Timestamps issued by [`ReplClock::tick`] strictly increase
//! - [`ReplClock::now`] never goes backwards and never falls below the last tick
//! - [`ReplTimestamp::INVALID`] is never issued

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::time::TimeSource;

/// A replication timestamp.
///
/// Totally ordered. [`INVALID`](Self::INVALID) is a sentinel used by backfill
/// deletions and is greater than every real timestamp, so it must never reach
/// the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplTimestamp(u64);

impl ReplTimestamp {
    /// Sentinel meaning "no timestamp".
    pub const INVALID: Self = Self(u64::MAX);

    /// The smallest real timestamp. A backfill since this time copies everything.
    pub const DISTANT_PAST: Self = Self(0);

    #[must_use]
    pub const fn new(time: u64) -> Self {
        Self(time)
    }

    #[must_use]
    pub const fn time(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    /// The next timestamp, capped just below [`INVALID`](Self::INVALID).
    #[must_use]
    pub const fn next(self) -> Self {
        if self.0 >= u64::MAX - 1 {
            Self(u64::MAX - 1)
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for ReplTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// A proposed CAS value paired with the mutation's replication timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasTime {
    pub proposed_cas: u64,
    pub timestamp: ReplTimestamp,
}

impl CasTime {
    #[must_use]
    pub const fn new(proposed_cas: u64, timestamp: ReplTimestamp) -> Self {
        Self {
            proposed_cas,
            timestamp,
        }
    }
}

/// Monotonic clock over a [`TimeSource`].
///
/// Follows wall-clock milliseconds while they advance; when two ticks land in
/// the same millisecond (or the wall clock steps backwards) the clock runs one
/// unit ahead of the last issued timestamp instead.
#[derive(Debug)]
pub struct ReplClock<T: TimeSource> {
    time_source: T,
    last: ReplTimestamp,
}

impl<T: TimeSource> ReplClock<T> {
    #[must_use]
    pub const fn new(time_source: T) -> Self {
        Self {
            time_source,
            last: ReplTimestamp::DISTANT_PAST,
        }
    }

    /// Create a clock that will never issue a timestamp at or below `last`.
    #[must_use]
    pub const fn from_timestamp(last: ReplTimestamp, time_source: T) -> Self {
        Self { time_source, last }
    }

    /// Issue a new timestamp, strictly greater than every earlier one.
    pub fn tick(&mut self) -> ReplTimestamp {
        let now = ReplTimestamp::new(self.time_source.now_ms().min(u64::MAX - 1));
        self.last = now.max(self.last.next());
        self.last
    }

    /// Current time without issuing a new timestamp.
    #[must_use]
    pub fn now(&self) -> ReplTimestamp {
        let now = ReplTimestamp::new(self.time_source.now_ms().min(u64::MAX - 1));
        now.max(self.last)
    }

    /// The last timestamp issued by [`tick`](Self::tick).
    #[must_use]
    pub const fn last(&self) -> ReplTimestamp {
        self.last
    }
}

/// Shared stamping authority for all shard workers.
///
/// [`stamp_with`](Self::stamp_with) runs its callback while the clock lock is
/// held, so anything the callback enqueues is ordered exactly like the stamps.
pub struct Timestamper {
    clock: Mutex<ReplClock<Box<dyn TimeSource>>>,
    next_cas: AtomicU64,
}

impl Timestamper {
    #[must_use]
    pub fn new(time_source: impl TimeSource + 'static) -> Self {
        Self {
            clock: Mutex::new(ReplClock::new(Box::new(time_source))),
            next_cas: AtomicU64::new(1),
        }
    }

    /// Stamp a new [`CasTime`] and hand it to `f` under the clock lock.
    pub fn stamp_with<R>(&self, f: impl FnOnce(CasTime) -> R) -> R {
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let mut clock = self.clock.lock().expect("lock poisoned");
        let timestamp = clock.tick();
        let proposed_cas = self.next_cas.fetch_add(1, Ordering::Relaxed);
        f(CasTime::new(proposed_cas, timestamp))
    }

    /// Stamp a new [`CasTime`].
    pub fn stamp(&self) -> CasTime {
        self.stamp_with(|castime| castime)
    }

    /// The current time as seen by the shared clock.
    #[must_use]
    pub fn current_time(&self) -> ReplTimestamp {
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let clock = self.clock.lock().expect("lock poisoned");
        clock.now()
    }
}

impl fmt::Debug for Timestamper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timestamper")
            .field("next_cas", &self.next_cas.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::time::ManualTimeSource;

    #[test]
    fn test_tick_follows_wall_clock() {
        let time = Arc::new(ManualTimeSource::new(100));
        let mut clock = ReplClock::new(Arc::clone(&time));

        assert_eq!(clock.tick(), ReplTimestamp::new(100));
        time.advance(50);
        assert_eq!(clock.tick(), ReplTimestamp::new(150));
    }

    #[test]
    fn test_tick_strictly_increases_within_same_millisecond() {
        let time = ManualTimeSource::new(100);
        let mut clock = ReplClock::new(time);

        let t1 = clock.tick();
        let t2 = clock.tick();
        let t3 = clock.tick();
        assert!(t1 < t2 && t2 < t3);
        assert_eq!(t3, ReplTimestamp::new(102));
    }

    #[test]
    fn test_clock_survives_backwards_wall_clock() {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let mut clock = ReplClock::new(Arc::clone(&time));
        let before = clock.tick();

        time.set(10);
        let after = clock.tick();
        assert!(after > before);
        assert!(clock.now() >= after);
    }

    #[test]
    fn test_from_timestamp_never_goes_below_restored_value() {
        let time = ManualTimeSource::new(5);
        let mut clock = ReplClock::from_timestamp(ReplTimestamp::new(500), time);
        assert_eq!(clock.now(), ReplTimestamp::new(500));
        assert_eq!(clock.tick(), ReplTimestamp::new(501));
    }

    #[test]
    fn test_clock_never_issues_invalid() {
        let time = ManualTimeSource::new(u64::MAX);
        let mut clock = ReplClock::new(time);
        let t1 = clock.tick();
        let t2 = clock.tick();
        assert!(t1.is_valid());
        assert!(t2.is_valid());
    }

    #[test]
    fn test_timestamper_assigns_unique_cas() {
        let stamper = Timestamper::new(ManualTimeSource::new(7));
        let a = stamper.stamp();
        let b = stamper.stamp();
        assert_ne!(a.proposed_cas, b.proposed_cas);
        assert!(b.timestamp > a.timestamp);
        assert!(stamper.current_time() >= b.timestamp);
    }

    #[test]
    fn test_invalid_timestamp_display() {
        assert_eq!(ReplTimestamp::INVALID.to_string(), "invalid");
        assert_eq!(ReplTimestamp::new(12).to_string(), "12");
        assert!(ReplTimestamp::INVALID > ReplTimestamp::new(u64::MAX - 1));
    }
}
