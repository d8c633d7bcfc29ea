//! Cancellable one-shot timer used for the heartbeat.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::AbortHandle;

/// At most one pending callback. Scheduling again replaces the previous one.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    pending: Mutex<Option<AbortHandle>>,
}

impl OneShotTimer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` after `delay`, cancelling whatever was scheduled before.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });

        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let mut pending = self.pending.lock().expect("lock poisoned");
        if let Some(previous) = pending.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let mut pending = self.pending.lock().expect("lock poisoned");
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }

    /// Whether a callback is scheduled and has not yet run.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let pending = self.pending.lock().expect("lock poisoned");
        pending.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.get_mut() {
            if let Some(handle) = pending.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        (fired, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let timer = OneShotTimer::new();
        let (fired, callback) = counter();
        timer.schedule(Duration::from_millis(100), callback);
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_callback() {
        let timer = OneShotTimer::new();
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();

        timer.schedule(Duration::from_millis(100), first_cb);
        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.schedule(Duration::from_millis(100), second_cb);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let timer = OneShotTimer::new();
        let (fired, callback) = counter();
        timer.schedule(Duration::from_millis(10), callback);
        timer.cancel();
        assert!(!timer.is_armed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
