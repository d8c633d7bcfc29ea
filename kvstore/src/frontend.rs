//! Entry point for client mutations.
//!
//! [`Frontend::submit`] runs a mutation on the shard that owns its key. On
//! that shard it is stamped, passed through the dispatcher (which queues the
//! replication copy) and applied to the store.

use std::fmt;
use std::sync::Arc;

use crate::replication::dispatcher::MasterDispatcher;
use crate::replication::mutation::Mutation;
use crate::shards::{ShardError, ShardPool, shard_for_key};
use crate::store::{KeyValueStore, MutationResult, StoreError};

#[derive(Clone)]
pub struct Frontend {
    shards: Arc<ShardPool>,
    store: Arc<dyn KeyValueStore>,
    dispatcher: MasterDispatcher,
}

impl Frontend {
    #[must_use]
    pub fn new(
        shards: Arc<ShardPool>,
        store: Arc<dyn KeyValueStore>,
        dispatcher: MasterDispatcher,
    ) -> Self {
        Self {
            shards,
            store,
            dispatcher,
        }
    }

    pub async fn submit(&self, mutation: Mutation) -> Result<MutationResult, FrontendError> {
        let shard = shard_for_key(mutation.key(), self.shards.shard_count());
        let store = Arc::clone(&self.store);
        let dispatcher = self.dispatcher.clone();

        self.shards
            .run_on(shard, move |ctx| async move {
                let (local, castime) = ctx
                    .timestamper()
                    .stamp_with(|castime| (dispatcher.dispatch_change(mutation, castime), castime));
                store.apply(local, castime).await
            })
            .await?
            .map_err(FrontendError::Store)
    }
}

impl fmt::Debug for Frontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frontend")
            .field("shards", &self.shards.shard_count())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum FrontendError {
    Shard(ShardError),
    Store(StoreError),
}

impl fmt::Display for FrontendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shard(e) => write!(f, "shard error: {e}"),
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for FrontendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Shard(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

impl From<ShardError> for FrontendError {
    fn from(e: ShardError) -> Self {
        Self::Shard(e)
    }
}

impl From<StoreError> for FrontendError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::mutation::IncrDecrKind;
    use crate::storage::btree::StoreKey;
    use crate::store::{BtreeStore, IncrDecrResult, SetResult};
    use crate::time::ManualTimeSource;
    use crate::timestamp::Timestamper;

    #[tokio::test]
    async fn test_submit_applies_locally_without_master() {
        let timestamper = Arc::new(Timestamper::new(ManualTimeSource::new(1_000)));
        let shards = Arc::new(ShardPool::spawn(3, timestamper));
        let store = Arc::new(BtreeStore::new(3).expect("should create store"));
        let frontend = Frontend::new(
            shards,
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            MasterDispatcher::detached(),
        );
        let key = StoreKey::try_from("hits").expect("valid key");

        let set = frontend
            .submit(Mutation::set(key.clone(), b"41".to_vec(), 0, 0))
            .await
            .expect("should submit");
        assert_eq!(set, MutationResult::Sarc(SetResult::Stored));

        let incr = frontend
            .submit(Mutation::IncrDecr {
                kind: IncrDecrKind::Incr,
                key: key.clone(),
                amount: 1,
            })
            .await
            .expect("should submit");
        assert_eq!(incr, MutationResult::IncrDecr(IncrDecrResult::Success(42)));
        assert_eq!(
            store.get(&key).expect("should read").map(|v| v.data),
            Some(b"42".to_vec())
        );
    }
}
