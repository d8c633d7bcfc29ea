//! Watermark no-ops and idle heartbeats across shards.

use std::time::Duration;

use super::helpers::{TestNode, config, key_on_shard};
use crate::replication::mutation::Mutation;
use crate::replication::protocol::ReplMessage;
use crate::timestamp::ReplTimestamp;

#[tokio::test(start_paused = true)]
async fn test_mutations_on_two_shards_are_followed_by_watermark_nop() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;

    let first = key_on_shard("left", 0, 2);
    let second = key_on_shard("right", 1, 2);

    node.time.set(5_000);
    node.submit(Mutation::set(first.clone(), b"a".to_vec(), 0, 0)).await;
    node.time.set(7_000);
    node.submit(Mutation::set(second.clone(), b"b".to_vec(), 0, 0)).await;

    let mut mutations = Vec::new();
    let mut last = ReplTimestamp::DISTANT_PAST;
    loop {
        let message = replica.next_message().await;
        let timestamp = message.timestamp().expect("real-time messages carry a timestamp");
        assert!(timestamp >= last, "{timestamp} arrived after {last}");
        last = timestamp;
        match message {
            ReplMessage::Nop { timestamp } if timestamp == ReplTimestamp::new(7_000) => break,
            ReplMessage::Nop { .. } => {}
            ReplMessage::Sarc { key, timestamp, .. } => mutations.push((key, timestamp)),
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(
        mutations,
        vec![
            (first, ReplTimestamp::new(5_000)),
            (second, ReplTimestamp::new(7_000)),
        ]
    );
    assert_eq!(node.master.latest_timestamp(), ReplTimestamp::new(7_000));
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_gets_heartbeat_nop_with_current_time() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;

    node.time.set(5_000);
    node.set("k", b"v").await;
    assert!(matches!(replica.next_non_nop().await, ReplMessage::Sarc { .. }));

    let idle_since = tokio::time::Instant::now();
    node.time.set(9_000);
    loop {
        if let ReplMessage::Nop { timestamp } = replica.next_message().await {
            if timestamp == ReplTimestamp::new(9_000) {
                break;
            }
        }
    }
    let waited = idle_since.elapsed();
    assert!(waited <= Duration::from_millis(1_100), "heartbeat took {waited:?}");
    assert_eq!(node.master.latest_timestamp(), ReplTimestamp::new(9_000));
}

#[tokio::test(start_paused = true)]
async fn test_no_heartbeat_nop_when_clock_has_not_moved() {
    let node = TestNode::start(config(1)).await;
    let mut replica = node.attach_replica().await;

    node.time.set(5_000);
    node.set("k", b"v").await;
    assert!(matches!(replica.next_non_nop().await, ReplMessage::Sarc { .. }));
    assert_eq!(
        replica.next_message().await,
        ReplMessage::Nop {
            timestamp: ReplTimestamp::new(5_000)
        }
    );

    // Several heartbeat intervals pass with the clock frozen.
    let quiet = tokio::time::timeout(Duration::from_secs(4), replica.recv()).await;
    assert!(quiet.is_err(), "expected silence, got {quiet:?}");
}
