//! Backfill of stored entries and deletions to a newly attached replica.

use super::helpers::{TestNode, config, key};
use crate::replication::data_provider::DataProvider;
use crate::replication::mutation::{AddPolicy, Mutation, ReplacePolicy};
use crate::replication::protocol::ReplMessage;
use crate::store::KeyValueStore;
use crate::timestamp::{CasTime, ReplTimestamp};

const SINCE: u64 = 500;

async fn put(node: &TestNode, k: &str, value: &[u8], at: u64) {
    let mutation = Mutation::Sarc {
        key: key(k),
        data: DataProvider::from_bytes(value.to_vec()),
        flags: 9,
        exptime: 0,
        add_policy: AddPolicy::Yes,
        replace_policy: ReplacePolicy::Yes,
        old_cas: 0,
    };
    node.store
        .apply(mutation, CasTime::new(at, ReplTimestamp::new(at)))
        .await
        .expect("should apply");
}

#[tokio::test]
async fn test_backfill_streams_changes_since_timestamp_then_barrier() {
    let node = TestNode::start(config(1)).await;
    put(&node, "a-old", b"before", SINCE - 1).await;
    put(&node, "b-at", b"exactly", SINCE).await;
    put(&node, "c-after", b"later", SINCE + 2).await;
    put(&node, "gone", b"short-lived", SINCE + 1).await;
    node.store
        .apply(
            Mutation::Delete { key: key("gone") },
            CasTime::new(0, ReplTimestamp::new(SINCE + 3)),
        )
        .await
        .expect("should delete");

    let mut replica = node.attach_replica().await;
    replica.request_backfill(ReplTimestamp::new(SINCE)).await;

    let mut sets = Vec::new();
    let barrier = loop {
        match replica.next_non_nop().await {
            ReplMessage::Sarc {
                key,
                value,
                timestamp,
                flags,
                add_policy,
                replace_policy,
                ..
            } => {
                assert_eq!(flags, 9);
                assert_eq!((add_policy, replace_policy), (AddPolicy::Yes, ReplacePolicy::Yes));
                sets.push((key.to_string(), value, timestamp.time()));
            }
            ReplMessage::Delete { key, timestamp } => {
                assert_eq!(key.to_string(), "gone");
                assert_eq!(timestamp, ReplTimestamp::INVALID);
            }
            ReplMessage::BackfillComplete {
                time_barrier_timestamp,
            } => break time_barrier_timestamp,
            other => panic!("unexpected message {other:?}"),
        }
    };

    assert_eq!(
        sets,
        vec![
            ("b-at".to_string(), b"exactly".to_vec(), SINCE),
            ("c-after".to_string(), b"later".to_vec(), SINCE + 2),
        ]
    );
    let now = node.shards.min_current_time().await.expect("should read shard clocks");
    assert!(barrier <= now, "barrier {barrier} is ahead of {now}");
    assert!(barrier >= ReplTimestamp::new(SINCE + 3));
}

#[tokio::test]
async fn test_backfill_of_empty_store_sends_only_barrier() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;
    replica.request_backfill(ReplTimestamp::DISTANT_PAST).await;

    assert!(matches!(
        replica.next_non_nop().await,
        ReplMessage::BackfillComplete { .. }
    ));
}

#[tokio::test]
async fn test_backfill_without_replica_is_rejected() {
    let node = TestNode::start(config(1)).await;
    let result = node.master.do_backfill(ReplTimestamp::DISTANT_PAST).await;
    assert!(matches!(result, Err(crate::replication::BackfillError::NoReplica)));
}

#[tokio::test]
async fn test_completed_backfill_forgets_deletions_the_replica_has() {
    let node = TestNode::start(config(1)).await;
    let history = [("early", SINCE - 5, SINCE - 2), ("late", SINCE + 1, SINCE + 2)];
    for (k, set_at, deleted_at) in history {
        put(&node, k, b"v", set_at).await;
        node.store
            .apply(
                Mutation::Delete { key: key(k) },
                CasTime::new(0, ReplTimestamp::new(deleted_at)),
            )
            .await
            .expect("should delete");
    }

    let mut replica = node.attach_replica().await;
    let mut deleted_keys = Vec::new();
    for since in [ReplTimestamp::new(SINCE), ReplTimestamp::DISTANT_PAST] {
        replica.request_backfill(since).await;
        let mut deleted = Vec::new();
        loop {
            match replica.next_non_nop().await {
                ReplMessage::Delete { key, .. } => deleted.push(key.to_string()),
                ReplMessage::BackfillComplete { .. } => break,
                other => panic!("unexpected message {other:?}"),
            }
        }
        deleted_keys.push(deleted);
    }

    // The second, full backfill no longer knows about "early".
    assert_eq!(deleted_keys, vec![vec!["late".to_string()], vec!["late".to_string()]]);
}
