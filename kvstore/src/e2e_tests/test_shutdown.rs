//! Master shutdown.

use super::helpers::{TestNode, config};
use crate::replication::BackfillError;
use crate::timestamp::ReplTimestamp;

#[tokio::test]
async fn test_shutdown_closes_replica_and_refuses_new_work() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;

    node.master.shutdown().await;
    assert!(!node.master.is_attached());
    replica.drain_until_closed().await;

    let mut late = node.attach_replica().await;
    assert_eq!(late.recv().await, None);
    assert!(!node.master.is_attached());

    let backfill = node.master.do_backfill(ReplTimestamp::DISTANT_PAST).await;
    assert!(matches!(backfill, Err(BackfillError::ShuttingDown)));

    // The local store keeps working.
    node.set("k", b"v").await;
}
