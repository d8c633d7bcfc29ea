//! [`KeyValueStore`] over one B-tree per shard, with memcached semantics.
//!
//! Keys are routed with [`shard_for_key`], the same function the frontend
//! uses, so a tree is only ever touched from its own shard context.
//!
//! A stored CAS of zero means none has been assigned. `get_cas` assigns the
//! mutation's proposed CAS on first read; every other write resets it.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::replication::mutation::{
    AddPolicy, AppendPrependKind, IncrDecrKind, Mutation, ReplacePolicy,
};
use crate::shards::shard_for_key;
use crate::storage::BlockCache;
use crate::storage::btree::{
    BTree, BackfillAtom, MAX_INLINE_VALUE_SIZE, MemcachedValue, MemcachedValueSizer,
    StoreKey,
};
use crate::store::{
    AppendPrependResult, BackfillEvent, BackfillItem, DeleteResult, IncrDecrResult, KeyValueStore,
    MutationResult, SetResult, StoreError,
};
use crate::timestamp::{CasTime, ReplTimestamp};

type Tree = BTree<MemcachedValueSizer>;

#[derive(Debug)]
pub struct BtreeStore {
    shards: Vec<Mutex<Tree>>,
}

impl BtreeStore {
    pub fn new(shard_count: usize) -> Result<Self, StoreError> {
        assert!(shard_count > 0, "store needs at least one shard");
        let shards = (0..shard_count)
            .map(|_| BTree::create(BlockCache::new(), MemcachedValueSizer).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { shards })
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Read a value without touching its CAS.
    pub fn get(&self, key: &StoreKey) -> Result<Option<MemcachedValue>, StoreError> {
        let tree = self.lock(key);
        read_value(&tree, key)
    }

    /// Total live keys across all shards.
    pub fn population(&self) -> Result<i64, StoreError> {
        let mut total = 0;
        for shard in &self.shards {
            #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
            let tree = shard.lock().expect("lock poisoned");
            total += tree.population()?;
        }
        Ok(total)
    }

    fn lock(&self, key: &StoreKey) -> std::sync::MutexGuard<'_, Tree> {
        let shard = &self.shards[shard_for_key(key, self.shards.len())];
        #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
        shard.lock().expect("lock poisoned")
    }

    async fn apply_mutation(
        &self,
        mutation: Mutation,
        castime: CasTime,
    ) -> Result<MutationResult, StoreError> {
        let timestamp = castime.timestamp;
        match mutation {
            Mutation::GetCas { key } => {
                let mut tree = self.lock(&key);
                let Some(mut value) = read_value(&tree, &key)? else {
                    return Ok(MutationResult::GetCas(None));
                };
                if value.cas == 0 {
                    value.cas = castime.proposed_cas;
                    tree.set(key, value.encode()?, timestamp)?;
                }
                Ok(MutationResult::GetCas(Some(value)))
            }
            Mutation::Sarc {
                key,
                data,
                flags,
                exptime,
                add_policy,
                replace_policy,
                old_cas,
            } => {
                let data = data.read_all().await?;
                let mut tree = self.lock(&key);
                let existing = read_value(&tree, &key)?;
                let verdict = match (&existing, add_policy, replace_policy) {
                    (None, _, ReplacePolicy::IfCasMatches) => Some(SetResult::NotFound),
                    (None, AddPolicy::No, _) | (Some(_), _, ReplacePolicy::No) => {
                        Some(SetResult::NotStored)
                    }
                    (Some(current), _, ReplacePolicy::IfCasMatches) if current.cas != old_cas => {
                        Some(SetResult::Exists)
                    }
                    _ => None,
                };
                if let Some(result) = verdict {
                    return Ok(MutationResult::Sarc(result));
                }
                if data.len() > MAX_INLINE_VALUE_SIZE {
                    return Ok(MutationResult::Sarc(SetResult::TooLarge));
                }
                let value = MemcachedValue::new(data, flags, exptime);
                tree.set(key, value.encode()?, timestamp)?;
                Ok(MutationResult::Sarc(SetResult::Stored))
            }
            Mutation::IncrDecr { kind, key, amount } => {
                let mut tree = self.lock(&key);
                let Some(mut value) = read_value(&tree, &key)? else {
                    return Ok(MutationResult::IncrDecr(IncrDecrResult::NotFound));
                };
                let Some(current) = parse_decimal(&value.data) else {
                    return Ok(MutationResult::IncrDecr(IncrDecrResult::NotNumeric));
                };
                let updated = match kind {
                    IncrDecrKind::Incr => current.wrapping_add(amount),
                    IncrDecrKind::Decr => current.saturating_sub(amount),
                };
                value.data = updated.to_string().into_bytes();
                value.cas = 0;
                tree.set(key, value.encode()?, timestamp)?;
                Ok(MutationResult::IncrDecr(IncrDecrResult::Success(updated)))
            }
            Mutation::AppendPrepend { kind, key, data } => {
                let data = data.read_all().await?;
                let mut tree = self.lock(&key);
                let Some(mut value) = read_value(&tree, &key)? else {
                    return Ok(MutationResult::AppendPrepend(AppendPrependResult::NotFound));
                };
                if value.data.len() + data.len() > MAX_INLINE_VALUE_SIZE {
                    return Ok(MutationResult::AppendPrepend(AppendPrependResult::TooLarge));
                }
                value.data = match kind {
                    AppendPrependKind::Append => [value.data.as_slice(), &data].concat(),
                    AppendPrependKind::Prepend => [data.as_slice(), &value.data].concat(),
                };
                value.cas = 0;
                tree.set(key, value.encode()?, timestamp)?;
                Ok(MutationResult::AppendPrepend(AppendPrependResult::Success))
            }
            Mutation::Delete { key } => {
                let mut tree = self.lock(&key);
                let result = if tree.delete(&key, timestamp)?.is_some() {
                    DeleteResult::Deleted
                } else {
                    DeleteResult::NotFound
                };
                Ok(MutationResult::Delete(result))
            }
        }
    }

    fn backfill_into(
        &self,
        since: ReplTimestamp,
        sink: &mpsc::UnboundedSender<BackfillEvent>,
    ) -> Result<ControlFlow<()>, StoreError> {
        for shard in &self.shards {
            #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
            let tree = shard.lock().expect("lock poisoned");
            let mut failure = None;
            let mut receiver_gone = false;
            tree.backfill(since, &mut |atom| {
                let item = match atom {
                    BackfillAtom::Set {
                        key,
                        value,
                        timestamp,
                    } => match MemcachedValue::decode(&value) {
                        Ok(value) => BackfillItem::Set {
                            key,
                            value,
                            timestamp,
                        },
                        Err(e) => {
                            failure = Some(e);
                            return ControlFlow::Break(());
                        }
                    },
                    BackfillAtom::Delete { key, timestamp } => {
                        BackfillItem::Delete { key, timestamp }
                    }
                };
                if sink.send(BackfillEvent::Item(item)).is_err() {
                    receiver_gone = true;
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            })?;
            if let Some(e) = failure {
                return Err(e.into());
            }
            if receiver_gone {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}

impl KeyValueStore for BtreeStore {
    fn apply(
        &self,
        mutation: Mutation,
        castime: CasTime,
    ) -> BoxFuture<'_, Result<MutationResult, StoreError>> {
        self.apply_mutation(mutation, castime).boxed()
    }

    fn spawn_backfill(
        self: Arc<Self>,
        since: ReplTimestamp,
        sink: mpsc::UnboundedSender<BackfillEvent>,
    ) {
        tokio::task::spawn_blocking(move || match self.backfill_into(since, &sink) {
            Ok(ControlFlow::Continue(())) => {
                let _ = sink.send(BackfillEvent::Done);
            }
            Ok(ControlFlow::Break(())) => {
                tracing::debug!(%since, "backfill receiver went away");
            }
            Err(e) => {
                // Dropping the sink without `Done` tells the consumer it failed.
                tracing::error!(%since, error = %e, "backfill failed");
            }
        });
    }

    fn forget_deletions_before(&self, horizon: ReplTimestamp) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
                let mut tree = shard.lock().expect("lock poisoned");
                tree.forget_deletions_before(horizon)
            })
            .sum()
    }
}

fn read_value(tree: &Tree, key: &StoreKey) -> Result<Option<MemcachedValue>, StoreError> {
    tree.get(key)?
        .map(|pair| MemcachedValue::decode(&pair.value).map_err(StoreError::from))
        .transpose()
}

fn parse_decimal(data: &[u8]) -> Option<u64> {
    if data.is_empty() || !data.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(data).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::data_provider::DataProvider;

    fn key(s: &str) -> StoreKey {
        StoreKey::try_from(s).expect("valid key")
    }

    fn at(t: u64, cas: u64) -> CasTime {
        CasTime::new(cas, ReplTimestamp::new(t))
    }

    fn sarc(
        k: &str,
        data: &[u8],
        add: AddPolicy,
        replace: ReplacePolicy,
        old_cas: u64,
    ) -> Mutation {
        Mutation::Sarc {
            key: key(k),
            data: DataProvider::from_bytes(data.to_vec()),
            flags: 3,
            exptime: 0,
            add_policy: add,
            replace_policy: replace,
            old_cas,
        }
    }

    async fn apply(store: &BtreeStore, mutation: Mutation, castime: CasTime) -> MutationResult {
        store.apply(mutation, castime).await.expect("should apply")
    }

    #[tokio::test]
    async fn test_set_add_replace_policies() {
        let store = BtreeStore::new(2).expect("should create store");

        let replace_missing = sarc("k", b"v", AddPolicy::No, ReplacePolicy::Yes, 0);
        assert_eq!(
            apply(&store, replace_missing, at(1, 1)).await,
            MutationResult::Sarc(SetResult::NotStored)
        );

        let add = sarc("k", b"v1", AddPolicy::Yes, ReplacePolicy::No, 0);
        assert_eq!(apply(&store, add, at(2, 2)).await, MutationResult::Sarc(SetResult::Stored));

        let add_again = sarc("k", b"v2", AddPolicy::Yes, ReplacePolicy::No, 0);
        assert_eq!(
            apply(&store, add_again, at(3, 3)).await,
            MutationResult::Sarc(SetResult::NotStored)
        );

        let stored = store.get(&key("k")).expect("should read").expect("present");
        assert_eq!(stored.data, b"v1");
        assert_eq!(stored.flags, 3);
    }

    #[tokio::test]
    async fn test_get_cas_assigns_once_and_cas_update_checks_it() {
        let store = BtreeStore::new(1).expect("should create store");
        apply(&store, Mutation::set(key("k"), b"v".to_vec(), 0, 0), at(1, 1)).await;

        let first = apply(&store, Mutation::GetCas { key: key("k") }, at(2, 77)).await;
        let MutationResult::GetCas(Some(value)) = first else {
            panic!("expected a value, got {first:?}");
        };
        assert_eq!(value.cas, 77);

        let second = apply(&store, Mutation::GetCas { key: key("k") }, at(3, 78)).await;
        assert_eq!(second, MutationResult::GetCas(Some(value)));

        let wrong = sarc("k", b"x", AddPolicy::No, ReplacePolicy::IfCasMatches, 1);
        assert_eq!(apply(&store, wrong, at(4, 79)).await, MutationResult::Sarc(SetResult::Exists));

        let right = sarc("k", b"y", AddPolicy::No, ReplacePolicy::IfCasMatches, 77);
        assert_eq!(apply(&store, right, at(5, 80)).await, MutationResult::Sarc(SetResult::Stored));
        assert_eq!(store.get(&key("k")).expect("should read").map(|v| v.cas), Some(0));

        let missing = sarc("nope", b"y", AddPolicy::No, ReplacePolicy::IfCasMatches, 77);
        assert_eq!(
            apply(&store, missing, at(6, 81)).await,
            MutationResult::Sarc(SetResult::NotFound)
        );

        let absent = apply(&store, Mutation::GetCas { key: key("nope") }, at(7, 82)).await;
        assert_eq!(absent, MutationResult::GetCas(None));
    }

    #[tokio::test]
    async fn test_incr_wraps_and_decr_saturates() {
        let store = BtreeStore::new(1).expect("should create store");
        let max = u64::MAX.to_string().into_bytes();
        apply(&store, Mutation::set(key("n"), max, 0, 0), at(1, 1)).await;

        let incr = Mutation::IncrDecr {
            kind: IncrDecrKind::Incr,
            key: key("n"),
            amount: 2,
        };
        assert_eq!(
            apply(&store, incr, at(2, 2)).await,
            MutationResult::IncrDecr(IncrDecrResult::Success(1))
        );

        let decr = Mutation::IncrDecr {
            kind: IncrDecrKind::Decr,
            key: key("n"),
            amount: 5,
        };
        assert_eq!(
            apply(&store, decr, at(3, 3)).await,
            MutationResult::IncrDecr(IncrDecrResult::Success(0))
        );

        apply(&store, Mutation::set(key("s"), b"abc".to_vec(), 0, 0), at(4, 4)).await;
        let not_numeric = Mutation::IncrDecr {
            kind: IncrDecrKind::Incr,
            key: key("s"),
            amount: 1,
        };
        assert_eq!(
            apply(&store, not_numeric, at(5, 5)).await,
            MutationResult::IncrDecr(IncrDecrResult::NotNumeric)
        );
    }

    #[tokio::test]
    async fn test_append_prepend_and_delete() {
        let store = BtreeStore::new(1).expect("should create store");
        apply(&store, Mutation::set(key("k"), b"mid".to_vec(), 0, 0), at(1, 1)).await;

        for (kind, data) in [
            (AppendPrependKind::Append, b"-end".as_slice()),
            (AppendPrependKind::Prepend, b"start-".as_slice()),
        ] {
            let mutation = Mutation::AppendPrepend {
                kind,
                key: key("k"),
                data: DataProvider::from_bytes(data.to_vec()),
            };
            assert_eq!(
                apply(&store, mutation, at(2, 2)).await,
                MutationResult::AppendPrepend(AppendPrependResult::Success)
            );
        }
        let value = store.get(&key("k")).expect("should read").expect("present");
        assert_eq!(value.data, b"start-mid-end");

        let too_big = Mutation::AppendPrepend {
            kind: AppendPrependKind::Append,
            key: key("k"),
            data: DataProvider::from_bytes(vec![0; MAX_INLINE_VALUE_SIZE]),
        };
        assert_eq!(
            apply(&store, too_big, at(3, 3)).await,
            MutationResult::AppendPrepend(AppendPrependResult::TooLarge)
        );

        let delete = Mutation::Delete { key: key("k") };
        assert_eq!(
            apply(&store, delete, at(4, 4)).await,
            MutationResult::Delete(DeleteResult::Deleted)
        );
        let again = Mutation::Delete { key: key("k") };
        assert_eq!(
            apply(&store, again, at(5, 5)).await,
            MutationResult::Delete(DeleteResult::NotFound)
        );
        assert_eq!(store.population().expect("should count"), 0);
    }

    #[tokio::test]
    async fn test_backfill_streams_sets_then_deletes_then_done() {
        let store = Arc::new(BtreeStore::new(1).expect("should create store"));
        apply(&store, Mutation::set(key("old"), b"1".to_vec(), 0, 0), at(10, 1)).await;
        apply(&store, Mutation::set(key("new"), b"2".to_vec(), 9, 0), at(20, 2)).await;
        apply(&store, Mutation::set(key("gone"), b"3".to_vec(), 0, 0), at(21, 3)).await;
        apply(&store, Mutation::Delete { key: key("gone") }, at(22, 4)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        Arc::clone(&store).spawn_backfill(ReplTimestamp::new(15), tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        let expected_value = MemcachedValue::new(b"2".to_vec(), 9, 0);
        assert_eq!(
            events,
            vec![
                BackfillEvent::Item(BackfillItem::Set {
                    key: key("new"),
                    value: expected_value,
                    timestamp: ReplTimestamp::new(20),
                }),
                BackfillEvent::Item(BackfillItem::Delete {
                    key: key("gone"),
                    timestamp: ReplTimestamp::new(22),
                }),
                BackfillEvent::Done,
            ]
        );
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal(b"0"), Some(0));
        assert_eq!(parse_decimal(b"18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_decimal(b"18446744073709551616"), None);
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"-1"), None);
        assert_eq!(parse_decimal(b"1 "), None);
    }
}
