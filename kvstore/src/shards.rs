//! Shard execution contexts.
//!
//! A [`ShardPool`] runs N worker tasks. Each worker drains its own job queue
//! one job at a time, so everything queued on a shard runs in submission
//! order and never concurrently with another job on the same shard. Keys are
//! routed to shards by CRC-32.
//!
//! # Invariants
//!
//! - A job queued on a shard runs after every job queued on it earlier
//! - All shards share one [`Timestamper`]
//! - Workers exit once the pool is dropped

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use tokio::sync::{mpsc, oneshot};

use crate::storage::btree::StoreKey;
use crate::timestamp::{ReplTimestamp, Timestamper};

type ShardJob = Box<dyn FnOnce(ShardContext) -> BoxFuture<'static, ()> + Send>;

/// What a job running on a shard can see.
#[derive(Debug, Clone)]
pub struct ShardContext {
    shard: usize,
    timestamper: Arc<Timestamper>,
}

impl ShardContext {
    #[must_use]
    pub const fn shard(&self) -> usize {
        self.shard
    }

    #[must_use]
    pub const fn timestamper(&self) -> &Arc<Timestamper> {
        &self.timestamper
    }

    /// This shard's view of the current replication time.
    #[must_use]
    pub fn current_time(&self) -> ReplTimestamp {
        self.timestamper.current_time()
    }
}

#[derive(Debug)]
pub struct ShardPool {
    queues: Vec<mpsc::UnboundedSender<ShardJob>>,
    timestamper: Arc<Timestamper>,
}

impl ShardPool {
    /// Start `count` workers. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(count: usize, timestamper: Arc<Timestamper>) -> Self {
        assert!(count > 0, "shard pool needs at least one shard");

        let queues = (0..count)
            .map(|shard| {
                let (tx, mut rx) = mpsc::unbounded_channel::<ShardJob>();
                let ctx = ShardContext {
                    shard,
                    timestamper: Arc::clone(&timestamper),
                };
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        job(ctx.clone()).await;
                    }
                    tracing::debug!(shard, "shard worker stopped");
                });
                tx
            })
            .collect();

        Self {
            queues,
            timestamper,
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub const fn timestamper(&self) -> &Arc<Timestamper> {
        &self.timestamper
    }

    /// Queue `job` on `shard` and wait for its result.
    pub async fn run_on<F, Fut, R>(&self, shard: usize, job: F) -> Result<R, ShardError>
    where
        F: FnOnce(ShardContext) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let queue = self.queues.get(shard).ok_or(ShardError::NoSuchShard(shard))?;
        let (tx, rx) = oneshot::channel();
        let boxed: ShardJob = Box::new(move |ctx| {
            Box::pin(async move {
                let _ = tx.send(job(ctx).await);
            })
        });
        queue.send(boxed).map_err(|_| ShardError::Stopped)?;
        rx.await.map_err(|_| ShardError::Stopped)
    }

    /// Wait until every shard has observed a current time of at least `t`.
    ///
    /// Each shard acknowledges once it has drained everything queued on it
    /// before this call.
    ///
    /// # Panics
    ///
    /// If any shard's clock is behind `t`. Timestamps are only ever issued by
    /// the shared clock, so this means the clock went backwards.
    pub async fn confirm_time_reached(&self, t: ReplTimestamp) -> Result<(), ShardError> {
        let acks = future::join_all((0..self.shard_count()).map(|shard| {
            self.run_on(shard, |ctx| async move { (ctx.shard(), ctx.current_time()) })
        }))
        .await;

        let mut confirmed = 0;
        for ack in acks {
            let (shard, now) = ack?;
            assert!(now >= t, "shard {shard} is at {now}, behind watermark {t}");
            confirmed += 1;
        }
        debug_assert_eq!(confirmed, self.shard_count());
        Ok(())
    }

    /// The smallest current time over all shards.
    pub async fn min_current_time(&self) -> Result<ReplTimestamp, ShardError> {
        let times = future::join_all(
            (0..self.shard_count())
                .map(|shard| self.run_on(shard, |ctx| async move { ctx.current_time() })),
        )
        .await;

        let mut min = ReplTimestamp::INVALID;
        for time in times {
            min = min.min(time?);
        }
        Ok(min)
    }
}

/// The shard that owns `key` in a pool of `count` shards.
#[must_use]
pub fn shard_for_key(key: &StoreKey, count: usize) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardError {
    NoSuchShard(usize),
    /// The worker is gone.
    Stopped,
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchShard(shard) => write!(f, "no shard {shard}"),
            Self::Stopped => write!(f, "shard worker stopped"),
        }
    }
}

impl std::error::Error for ShardError {}
