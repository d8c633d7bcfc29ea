//! A store that stops producing backfill entries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use super::helpers::{TestNode, config};
use crate::replication::BackfillError;
use crate::replication::mutation::Mutation;
use crate::store::{
    BackfillEvent, BtreeStore, DeleteResult, KeyValueStore, MutationResult, StoreError,
};
use crate::timestamp::{CasTime, ReplTimestamp};

/// Accepts backfill requests and never answers them.
#[derive(Default)]
struct StallingStore {
    sinks: Mutex<Vec<mpsc::UnboundedSender<BackfillEvent>>>,
}

impl KeyValueStore for StallingStore {
    fn apply(
        &self,
        _mutation: Mutation,
        _castime: CasTime,
    ) -> BoxFuture<'_, Result<MutationResult, StoreError>> {
        async { Ok(MutationResult::Delete(DeleteResult::NotFound)) }.boxed()
    }

    fn spawn_backfill(
        self: Arc<Self>,
        _since: ReplTimestamp,
        sink: mpsc::UnboundedSender<BackfillEvent>,
    ) {
        self.sinks.lock().expect("lock poisoned").push(sink);
    }

    fn forget_deletions_before(&self, _horizon: ReplTimestamp) -> usize {
        0
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_backfill_times_out() {
    let limit = Duration::from_millis(200);
    let mut config = config(1);
    config.backfill_stall_timeout = Some(limit);
    let store = Arc::new(BtreeStore::new(1).expect("should create store"));
    let node = TestNode::start_with_store(config, Arc::new(StallingStore::default()), store).await;
    let _replica = node.attach_replica().await;

    let result = node.master.do_backfill(ReplTimestamp::DISTANT_PAST).await;
    assert!(
        matches!(result, Err(BackfillError::TimedOut(waited)) if waited == limit),
        "unexpected result {result:?}"
    );
    assert!(node.master.is_attached());
}
