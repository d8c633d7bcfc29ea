//! Common helpers for end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::DuplexStream;

use crate::config::ReplicationConfig;
use crate::frontend::Frontend;
use crate::replication::Master;
use crate::replication::mutation::Mutation;
use crate::replication::protocol::{self, ReplMessage};
use crate::shards::{ShardPool, shard_for_key};
use crate::storage::btree::StoreKey;
use crate::store::{BtreeStore, KeyValueStore, MutationResult};
use crate::time::ManualTimeSource;
use crate::timestamp::{ReplTimestamp, Timestamper};

/// How long a replica waits for the next frame before the test fails.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A node: shard pool, store, master and frontend over a manual clock.
pub struct TestNode {
    pub time: Arc<ManualTimeSource>,
    pub shards: Arc<ShardPool>,
    pub store: Arc<BtreeStore>,
    pub master: Arc<Master>,
    pub frontend: Frontend,
}

impl TestNode {
    /// Create a node with its store registered on an ephemeral port.
    pub async fn start(config: ReplicationConfig) -> Self {
        let store = Arc::new(BtreeStore::new(config.shard_count).expect("should create store"));
        Self::start_with_store(config, Arc::clone(&store) as Arc<dyn KeyValueStore>, store).await
    }

    /// Create a node whose master backfills from `backfill_store` while the
    /// frontend applies to `store`.
    pub async fn start_with_store(
        config: ReplicationConfig,
        backfill_store: Arc<dyn KeyValueStore>,
        store: Arc<BtreeStore>,
    ) -> Self {
        let time = Arc::new(ManualTimeSource::new(1_000));
        let timestamper = Arc::new(Timestamper::new(Arc::clone(&time)));
        let shards = Arc::new(ShardPool::spawn(config.shard_count, timestamper));
        let master = Master::new(config, Arc::clone(&shards));
        master
            .register_key_value_store(backfill_store)
            .await
            .expect("should bind listener");

        let frontend = Frontend::new(
            Arc::clone(&shards),
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            master.dispatcher(),
        );
        Self {
            time,
            shards,
            store,
            master,
            frontend,
        }
    }

    pub async fn submit(&self, mutation: Mutation) -> MutationResult {
        self.frontend.submit(mutation).await.expect("should submit")
    }

    pub async fn set(&self, k: &str, value: &[u8]) -> MutationResult {
        self.submit(Mutation::set(key(k), value.to_vec(), 0, 0)).await
    }

    pub async fn attach_replica(&self) -> Replica {
        self.attach_replica_with_buffer(1 << 20).await
    }

    /// Attach a replica whose connection buffers at most `buffer` bytes
    /// before writes to it block.
    pub async fn attach_replica_with_buffer(&self, buffer: usize) -> Replica {
        let (ours, theirs) = tokio::io::duplex(buffer);
        self.master.on_replica_accept(theirs).await;
        Replica { conn: ours }
    }
}

/// Config with a single port-0 listener and the given shard count.
pub fn config(shard_count: usize) -> ReplicationConfig {
    ReplicationConfig {
        listen_port: 0,
        shard_count,
        ..ReplicationConfig::default()
    }
}

/// The replica side of a stream.
pub struct Replica {
    conn: DuplexStream,
}

impl Replica {
    /// Next frame, or `None` on clean end of stream.
    pub async fn recv(&mut self) -> Option<ReplMessage> {
        tokio::time::timeout(RECV_TIMEOUT, protocol::read_message(&mut self.conn))
            .await
            .expect("replica should receive within the timeout")
            .expect("frame should decode")
    }

    pub async fn next_message(&mut self) -> ReplMessage {
        self.recv().await.expect("stream should still be open")
    }

    /// Next frame that is not a no-op.
    pub async fn next_non_nop(&mut self) -> ReplMessage {
        loop {
            let message = self.next_message().await;
            if !matches!(message, ReplMessage::Nop { .. }) {
                return message;
            }
        }
    }

    pub async fn request_backfill(&mut self, since_when: ReplTimestamp) {
        protocol::write_message(&mut self.conn, &ReplMessage::BackfillRequest { since_when })
            .await
            .expect("should send backfill request");
    }

    /// Read until the master closes the stream, returning what arrived.
    pub async fn drain_until_closed(&mut self) -> Vec<ReplMessage> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv().await {
            messages.push(message);
        }
        messages
    }
}

pub fn key(s: &str) -> StoreKey {
    StoreKey::try_from(s).expect("valid key")
}

/// A key owned by `shard` in a pool of `count` shards.
pub fn key_on_shard(prefix: &str, shard: usize, count: usize) -> StoreKey {
    (0..)
        .map(|i| key(&format!("{prefix}{i}")))
        .find(|k| shard_for_key(k, count) == shard)
        .expect("some key hashes to every shard")
}
