//! The replication master.
//!
//! Forwards every mutation applied on this node to at most one attached
//! replica, in timestamp order, over the framed protocol in
//! [`protocol`](crate::replication::protocol).
//!
//! # Contexts
//!
//! - Home context: one task that runs forwarded mutations, heartbeats and
//!   no-ops in queue order. The queue is fed under the clock lock, so queue
//!   order is timestamp order.
//! - Shard contexts: see [`ShardPool`]. The watermark barrier runs one job on
//!   each before a no-op is queued.
//!
//! # Watermark
//!
//! Whenever a forwarded mutation carries a timestamp above the highest seen
//! so far, the master waits for every shard to confirm its clock has reached
//! it and then sends a no-op with that timestamp. The replica learns that
//! nothing older is still in flight. A heartbeat timer does the same with the
//! clock's current time once the stream has been idle for the configured
//! interval.
//!
//! # Invariants
//!
//! - At most one replica stream is attached
//! - Real-time messages are sent in non-decreasing timestamp order
//! - A replaced stream is fully torn down before its successor is installed
//! - After [`Master::shutdown`] starts, no new operation begins

#![allow(clippy::too_many_arguments)]

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

use crate::config::ReplicationConfig;
use crate::replication::data_provider::DataProvider;
use crate::replication::dispatcher::MasterDispatcher;
use crate::replication::hold::LivenessGuard;
use crate::replication::mutation::{
    AddPolicy, AppendPrependKind, IncrDecrKind, Mutation, ReplacePolicy,
};
use crate::replication::protocol::{self, ReplMessage};
use crate::replication::stream::{ReplStream, StreamError};
use crate::replication::timer::OneShotTimer;
use crate::shards::{ShardError, ShardPool};
use crate::storage::btree::StoreKey;
use crate::store::{BackfillEvent, BackfillItem, KeyValueStore};
use crate::timestamp::{CasTime, ReplTimestamp, Timestamper};

enum HomeJob {
    Forward { mutation: Mutation, castime: CasTime },
    Heartbeat,
    Nop(ReplTimestamp),
}

pub struct Master {
    config: ReplicationConfig,
    shards: Arc<ShardPool>,
    store: OnceLock<Arc<dyn KeyValueStore>>,
    stream: RwLock<Option<Arc<ReplStream>>>,
    /// Id of the attached stream, cleared by the close watcher.
    attached: watch::Sender<Option<u64>>,
    latest_timestamp: Mutex<ReplTimestamp>,
    /// Highest timestamp written to the real-time stream. Held across sends.
    last_sent: tokio::sync::Mutex<ReplTimestamp>,
    heartbeat: OneShotTimer,
    hold: LivenessGuard,
    accept_lock: tokio::sync::Mutex<()>,
    backfill_lock: tokio::sync::Mutex<()>,
    home_tx: mpsc::UnboundedSender<HomeJob>,
    next_stream_id: AtomicU64,
    listener: Mutex<Option<AbortHandle>>,
    weak_self: Weak<Self>,
}

impl Master {
    /// Create a master and start its home context. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn new(config: ReplicationConfig, shards: Arc<ShardPool>) -> Arc<Self> {
        let (home_tx, home_rx) = mpsc::unbounded_channel();
        let master = Arc::new_cyclic(|weak_self| Self {
            config,
            shards,
            store: OnceLock::new(),
            stream: RwLock::new(None),
            attached: watch::Sender::new(None),
            latest_timestamp: Mutex::new(ReplTimestamp::DISTANT_PAST),
            last_sent: tokio::sync::Mutex::new(ReplTimestamp::DISTANT_PAST),
            heartbeat: OneShotTimer::new(),
            hold: LivenessGuard::new(),
            accept_lock: tokio::sync::Mutex::new(()),
            backfill_lock: tokio::sync::Mutex::new(()),
            home_tx,
            next_stream_id: AtomicU64::new(1),
            listener: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        tokio::spawn(home_loop(Arc::downgrade(&master), home_rx));
        master
    }

    /// Bind the store backfills read from and start listening for a replica.
    ///
    /// # Panics
    ///
    /// If a store is already registered.
    pub async fn register_key_value_store(
        self: &Arc<Self>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<SocketAddr, MasterError> {
        assert!(
            self.store.set(store).is_ok(),
            "a key-value store is already registered with the master"
        );

        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .map_err(MasterError::Bind)?;
        let addr = listener.local_addr().map_err(MasterError::Bind)?;
        tracing::info!(%addr, "replication listener bound");

        let task = tokio::spawn(accept_loop(Arc::downgrade(self), listener));
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let mut slot = self.listener.lock().expect("lock poisoned");
        if let Some(previous) = slot.replace(task.abort_handle()) {
            previous.abort();
        }
        Ok(addr)
    }

    #[must_use]
    pub fn dispatcher(self: &Arc<Self>) -> MasterDispatcher {
        MasterDispatcher::new(Arc::clone(self))
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.borrow().is_some()
    }

    /// Watch the id of the attached stream.
    #[must_use]
    pub fn subscribe_attached(&self) -> watch::Receiver<Option<u64>> {
        self.attached.subscribe()
    }

    /// Highest mutation timestamp the watermark has seen.
    #[must_use]
    pub fn latest_timestamp(&self) -> ReplTimestamp {
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        *self.latest_timestamp.lock().expect("lock poisoned")
    }

    #[must_use]
    pub fn timestamper(&self) -> &Arc<Timestamper> {
        self.shards.timestamper()
    }

    /// Queue a mutation for forwarding on the home context.
    pub(crate) fn queue_forward(&self, mutation: Mutation, castime: CasTime) {
        // The home loop only stops once the master is gone.
        let _ = self.home_tx.send(HomeJob::Forward { mutation, castime });
    }

    /// Attach `conn` as the replica stream, replacing any current one.
    pub async fn on_replica_accept<T>(&self, conn: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(_hold) = self.hold.acquire() else {
            tracing::debug!("refusing replica connection during shutdown");
            return;
        };
        let _accept = self.accept_lock.lock().await;
        self.destroy_locked().await;

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(conn);
        let stream = Arc::new(ReplStream::new(id, writer));
        {
            #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
            let mut slot = self.stream.write().expect("lock poisoned");
            *slot = Some(Arc::clone(&stream));
        }
        self.attached.send_replace(Some(id));
        self.arm_heartbeat();
        tracing::info!(stream = id, "replica attached");

        tokio::spawn(read_loop(self.weak_self.clone(), Arc::clone(&stream), reader));

        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            stream.closed().await;
            if let Some(master) = weak.upgrade() {
                master.conn_closed(stream.id());
            }
        });
    }

    /// Tear down the attached stream, if any, and wait until it is gone.
    pub async fn destroy_existing_slave_conn_if_it_exists(&self) {
        let _accept = self.accept_lock.lock().await;
        self.destroy_locked().await;
    }

    pub async fn get_cas(&self, key: StoreKey, castime: CasTime) {
        let Some(_hold) = self.hold.acquire() else {
            return;
        };
        if !self.is_attached() {
            return;
        }
        self.consider_nop_dispatch_and_update_latest_timestamp(castime.timestamp);
        self.send_realtime(ReplMessage::GetCas {
            proposed_cas: castime.proposed_cas,
            timestamp: castime.timestamp,
            key,
        })
        .await;
    }

    pub async fn sarc(
        &self,
        key: StoreKey,
        data: DataProvider,
        flags: u32,
        exptime: u32,
        add_policy: AddPolicy,
        replace_policy: ReplacePolicy,
        old_cas: u64,
        castime: CasTime,
    ) {
        let Some(_hold) = self.hold.acquire() else {
            return;
        };
        if !self.is_attached() {
            return;
        }
        self.consider_nop_dispatch_and_update_latest_timestamp(castime.timestamp);
        let Some(value) = read_value(&key, data).await else {
            return;
        };
        self.send_realtime(ReplMessage::Sarc {
            timestamp: castime.timestamp,
            proposed_cas: castime.proposed_cas,
            flags,
            exptime,
            add_policy,
            replace_policy,
            old_cas,
            key,
            value,
        })
        .await;
    }

    pub async fn incr_decr(
        &self,
        kind: IncrDecrKind,
        key: StoreKey,
        amount: u64,
        castime: CasTime,
    ) {
        let Some(_hold) = self.hold.acquire() else {
            return;
        };
        if !self.is_attached() {
            return;
        }
        self.consider_nop_dispatch_and_update_latest_timestamp(castime.timestamp);
        self.send_realtime(ReplMessage::IncrDecr {
            kind,
            timestamp: castime.timestamp,
            proposed_cas: castime.proposed_cas,
            amount,
            key,
        })
        .await;
    }

    pub async fn append_prepend(
        &self,
        kind: AppendPrependKind,
        key: StoreKey,
        data: DataProvider,
        castime: CasTime,
    ) {
        let Some(_hold) = self.hold.acquire() else {
            return;
        };
        if !self.is_attached() {
            return;
        }
        self.consider_nop_dispatch_and_update_latest_timestamp(castime.timestamp);
        let Some(value) = read_value(&key, data).await else {
            return;
        };
        self.send_realtime(ReplMessage::AppendPrepend {
            kind,
            timestamp: castime.timestamp,
            proposed_cas: castime.proposed_cas,
            key,
            value,
        })
        .await;
    }

    /// Forward a delete. An `INVALID` timestamp bypasses the watermark.
    pub async fn delete_key(&self, key: StoreKey, timestamp: ReplTimestamp) {
        let Some(_hold) = self.hold.acquire() else {
            return;
        };
        if !self.is_attached() {
            return;
        }
        if timestamp.is_valid() {
            self.consider_nop_dispatch_and_update_latest_timestamp(timestamp);
        }
        self.send_realtime(ReplMessage::Delete { timestamp, key }).await;
    }

    /// Route a stamped mutation to its forwarding method.
    pub async fn forward(&self, mutation: Mutation, castime: CasTime) {
        match mutation {
            Mutation::GetCas { key } => self.get_cas(key, castime).await,
            Mutation::Sarc {
                key,
                data,
                flags,
                exptime,
                add_policy,
                replace_policy,
                old_cas,
            } => {
                self.sarc(
                    key,
                    data,
                    flags,
                    exptime,
                    add_policy,
                    replace_policy,
                    old_cas,
                    castime,
                )
                .await;
            }
            Mutation::IncrDecr { kind, key, amount } => {
                self.incr_decr(kind, key, amount, castime).await;
            }
            Mutation::AppendPrepend { kind, key, data } => {
                self.append_prepend(kind, key, data, castime).await;
            }
            Mutation::Delete { key } => self.delete_key(key, castime.timestamp).await,
        }
    }

    /// Advance the watermark to `timestamp` and re-arm the heartbeat.
    ///
    /// # Panics
    ///
    /// If `timestamp` is `INVALID`.
    pub fn consider_nop_dispatch_and_update_latest_timestamp(&self, timestamp: ReplTimestamp) {
        assert!(
            timestamp.is_valid(),
            "an invalid timestamp reached the replication watermark"
        );

        let advanced = {
            #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
            let mut latest = self.latest_timestamp.lock().expect("lock poisoned");
            if timestamp > *latest {
                *latest = timestamp;
                true
            } else {
                false
            }
        };
        if advanced {
            if let Some(master) = self.weak_self.upgrade() {
                tokio::spawn(async move { master.do_nop_rebound(timestamp).await });
            }
        }
        self.arm_heartbeat();
    }

    /// Wait for every shard to reach `timestamp`, then queue a no-op for it.
    async fn do_nop_rebound(&self, timestamp: ReplTimestamp) {
        let Some(_hold) = self.hold.acquire() else {
            return;
        };
        if let Err(e) = self.shards.confirm_time_reached(timestamp).await {
            tracing::warn!(%timestamp, error = %e, "watermark barrier failed");
            return;
        }
        let _ = self.home_tx.send(HomeJob::Nop(timestamp));
    }

    /// Stream every change since `since_when` to the replica, then a
    /// backfill-complete barrier.
    pub async fn do_backfill(&self, since_when: ReplTimestamp) -> Result<(), BackfillError> {
        let Some(_hold) = self.hold.acquire() else {
            return Err(BackfillError::ShuttingDown);
        };
        let _serial = self.backfill_lock.lock().await;
        let stream = self.current_stream().ok_or(BackfillError::NoReplica)?;
        let store = Arc::clone(self.store.get().ok_or(BackfillError::NoStore)?);

        tracing::info!(stream = stream.id(), %since_when, "backfill started");
        let (sink, mut events) = mpsc::unbounded_channel();
        Arc::clone(&store).spawn_backfill(since_when, sink);

        let mut sent = 0usize;
        loop {
            let event = match self.config.backfill_stall_timeout {
                Some(limit) => tokio::time::timeout(limit, events.recv())
                    .await
                    .map_err(|_| BackfillError::TimedOut(limit))?,
                None => events.recv().await,
            };
            match event {
                Some(BackfillEvent::Item(item)) => {
                    stream.send(&backfill_message(item)).await?;
                    sent += 1;
                }
                Some(BackfillEvent::Done) => break,
                None => return Err(BackfillError::StoreClosed),
            }
        }

        let barrier = self.shards.min_current_time().await?;
        stream
            .send(&ReplMessage::BackfillComplete {
                time_barrier_timestamp: barrier,
            })
            .await?;
        tracing::info!(stream = stream.id(), %since_when, sent, %barrier, "backfill finished");

        // The replica now holds every change before `since_when`.
        let forgotten = store.forget_deletions_before(since_when);
        if forgotten > 0 {
            tracing::debug!(%since_when, forgotten, "dropped deletions the replica already has");
        }
        Ok(())
    }

    /// Stop listening, refuse new work, wait for in-flight operations, then
    /// drop the replica.
    pub async fn shutdown(&self) {
        {
            #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
            let mut listener = self.listener.lock().expect("lock poisoned");
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
        // Aborts sends blocked on a replica that stopped reading.
        if let Some(stream) = self.current_stream() {
            stream.shutdown().await;
        }
        self.hold.close_and_drain().await;

        let _accept = self.accept_lock.lock().await;
        self.destroy_locked().await;
        self.heartbeat.cancel();
        tracing::info!("replication master shut down");
    }

    fn current_stream(&self) -> Option<Arc<ReplStream>> {
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        let slot = self.stream.read().expect("lock poisoned");
        slot.clone()
    }

    /// Requires the accept lock.
    async fn destroy_locked(&self) {
        let Some(stream) = self.current_stream() else {
            return;
        };
        let id = stream.id();
        let mut attached = self.attached.subscribe();
        stream.shutdown().await;
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = attached.wait_for(|current| *current != Some(id)).await;
        tracing::debug!(stream = id, "replica stream torn down");
    }

    fn conn_closed(&self, id: u64) {
        let removed = {
            #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
            let mut slot = self.stream.write().expect("lock poisoned");
            if slot.as_ref().is_some_and(|stream| stream.id() == id) {
                slot.take()
            } else {
                None
            }
        };
        if removed.is_some() {
            self.heartbeat.cancel();
            tracing::info!(stream = id, "replica detached");
        }
        self.attached.send_if_modified(|current| {
            if *current == Some(id) {
                *current = None;
                true
            } else {
                false
            }
        });
    }

    fn arm_heartbeat(&self) {
        let home = self.home_tx.clone();
        self.heartbeat.schedule(self.config.heartbeat_interval, move || {
            let _ = home.send(HomeJob::Heartbeat);
        });
    }

    /// Send a timestamped message on the real-time stream.
    ///
    /// # Panics
    ///
    /// If a mutation would go out with a timestamp below one already sent.
    async fn send_realtime(&self, message: ReplMessage) {
        let Some(stream) = self.current_stream() else {
            return;
        };
        let mut last_sent = self.last_sent.lock().await;
        let timestamp = message.timestamp().filter(|t| t.is_valid());
        if let Some(timestamp) = timestamp {
            if timestamp < *last_sent {
                assert!(
                    matches!(message, ReplMessage::Nop { .. }),
                    "replication timestamp went backwards: {timestamp} after {}",
                    *last_sent
                );
                tracing::debug!(%timestamp, last_sent = %*last_sent, "dropping stale no-op");
                return;
            }
        }

        match stream.send(&message).await {
            Ok(()) => {
                if let Some(timestamp) = timestamp {
                    *last_sent = timestamp;
                }
            }
            Err(e) => {
                tracing::warn!(stream = stream.id(), error = %e, "failed to send to replica");
            }
        }
    }

    async fn run_home_job(&self, job: HomeJob) {
        match job {
            HomeJob::Forward { mutation, castime } => self.forward(mutation, castime).await,
            HomeJob::Heartbeat => {
                if self.is_attached() {
                    let now = self.timestamper().current_time();
                    self.consider_nop_dispatch_and_update_latest_timestamp(now);
                }
            }
            HomeJob::Nop(timestamp) => {
                if self.is_attached() {
                    self.send_realtime(ReplMessage::Nop { timestamp }).await;
                }
            }
        }
    }
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("config", &self.config)
            .field("attached", &*self.attached.borrow())
            .field("latest_timestamp", &self.latest_timestamp())
            .finish_non_exhaustive()
    }
}

async fn home_loop(master: Weak<Master>, mut jobs: mpsc::UnboundedReceiver<HomeJob>) {
    while let Some(job) = jobs.recv().await {
        let Some(master) = master.upgrade() else {
            break;
        };
        master.run_home_job(job).await;
    }
}

async fn accept_loop(master: Weak<Master>, listener: TcpListener) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept replica connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let Some(master) = master.upgrade() else {
            break;
        };
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::info!(%peer, "replica connected");
        master.on_replica_accept(socket).await;
    }
}

/// Handle requests from the replica until the stream closes.
async fn read_loop<R>(master: Weak<Master>, stream: Arc<ReplStream>, mut reader: R)
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let message = tokio::select! {
            () = stream.closed() => break,
            message = protocol::read_message(&mut reader) => message,
        };
        match message {
            Ok(Some(ReplMessage::BackfillRequest { since_when })) => {
                let Some(master) = master.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if let Err(e) = master.do_backfill(since_when).await {
                        tracing::warn!(%since_when, error = %e, "backfill failed");
                    }
                });
            }
            Ok(Some(other)) => {
                tracing::warn!(code = ?other.code(), "ignoring unexpected message from replica");
            }
            Ok(None) => {
                tracing::debug!(stream = stream.id(), "replica closed its end");
                break;
            }
            Err(e) => {
                tracing::warn!(stream = stream.id(), error = %e, "failed to read from replica");
                break;
            }
        }
    }
    stream.mark_closed();
}

async fn read_value(key: &StoreKey, data: DataProvider) -> Option<Vec<u8>> {
    match data.read_all().await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(%key, error = %e, "dropping mutation with unreadable value");
            None
        }
    }
}

fn backfill_message(item: BackfillItem) -> ReplMessage {
    match item {
        BackfillItem::Set {
            key,
            value,
            timestamp,
        } => ReplMessage::Sarc {
            timestamp,
            proposed_cas: value.cas,
            flags: value.flags,
            exptime: value.exptime,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
            key,
            value: value.data,
        },
        BackfillItem::Delete { key, .. } => ReplMessage::Delete {
            timestamp: ReplTimestamp::INVALID,
            key,
        },
    }
}

#[derive(Debug)]
pub enum MasterError {
    Bind(io::Error),
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "failed to bind replication listener: {e}"),
        }
    }
}

impl std::error::Error for MasterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub enum BackfillError {
    ShuttingDown,
    NoReplica,
    NoStore,
    /// The store produced nothing for this long.
    TimedOut(Duration),
    /// The store stopped without finishing.
    StoreClosed,
    Stream(StreamError),
    Shards(ShardError),
}

impl fmt::Display for BackfillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShuttingDown => write!(f, "master is shutting down"),
            Self::NoReplica => write!(f, "no replica attached"),
            Self::NoStore => write!(f, "no key-value store registered"),
            Self::TimedOut(limit) => write!(f, "store stalled for more than {limit:?}"),
            Self::StoreClosed => write!(f, "store stopped before the backfill completed"),
            Self::Stream(e) => write!(f, "stream error: {e}"),
            Self::Shards(e) => write!(f, "shard error: {e}"),
        }
    }
}

impl std::error::Error for BackfillError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stream(e) => Some(e),
            Self::Shards(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StreamError> for BackfillError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

impl From<ShardError> for BackfillError {
    fn from(e: ShardError) -> Self {
        Self::Shards(e)
    }
}

