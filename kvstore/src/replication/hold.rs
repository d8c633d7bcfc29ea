//! Liveness holds.
//!
//! Every public master operation takes a [`Hold`] for its duration. Shutdown
//! closes the guard so no new holds are handed out, then waits until every
//! outstanding hold has been dropped.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Default, Clone, Copy)]
struct HoldState {
    count: usize,
    closing: bool,
}

/// Counted guard that can be drained exactly once.
#[derive(Debug, Clone)]
pub struct LivenessGuard {
    state: Arc<watch::Sender<HoldState>>,
}

impl Default for LivenessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessGuard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(HoldState::default())),
        }
    }

    /// Take a hold, or `None` once draining has started.
    #[must_use]
    pub fn acquire(&self) -> Option<Hold> {
        let mut acquired = false;
        self.state.send_if_modified(|state| {
            if state.closing {
                return false;
            }
            state.count += 1;
            acquired = true;
            true
        });
        acquired.then(|| Hold {
            state: Arc::clone(&self.state),
        })
    }

    /// Refuse new holds and wait for the outstanding ones to be released.
    pub async fn close_and_drain(&self) {
        self.state.send_modify(|state| state.closing = true);
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| state.count == 0).await;
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state.borrow().closing
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.borrow().count
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct Hold {
    state: Arc<watch::Sender<HoldState>>,
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.state.send_modify(|state| state.count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_holds_are_counted() {
        let guard = LivenessGuard::new();
        let a = guard.acquire().expect("should acquire");
        let b = guard.acquire().expect("should acquire");
        assert_eq!(guard.outstanding(), 2);
        drop(a);
        assert_eq!(guard.outstanding(), 1);
        drop(b);
        assert_eq!(guard.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drain_with_no_holds_returns_immediately() {
        let guard = LivenessGuard::new();
        guard.close_and_drain().await;
        assert!(guard.is_closing());
        assert!(guard.acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_outstanding_holds() {
        let guard = LivenessGuard::new();
        let hold = guard.acquire().expect("should acquire");

        let drainer = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.close_and_drain().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!drainer.is_finished());
        assert!(guard.acquire().is_none(), "draining guard refuses new holds");

        drop(hold);
        drainer.await.expect("drain task should finish");
        assert_eq!(guard.outstanding(), 0);
    }
}
