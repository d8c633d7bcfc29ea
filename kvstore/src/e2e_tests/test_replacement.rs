//! A second replica connection replaces the first.

use super::helpers::{TestNode, config, key};
use crate::replication::protocol::ReplMessage;

#[tokio::test]
async fn test_new_replica_replaces_old_one() {
    let node = TestNode::start(config(2)).await;
    let mut first = node.attach_replica().await;
    node.set("before", b"1").await;
    assert!(matches!(first.next_non_nop().await, ReplMessage::Sarc { .. }));

    let mut second = node.attach_replica().await;
    assert!(node.master.is_attached());

    let leftovers = first.drain_until_closed().await;
    assert!(
        leftovers.iter().all(|m| matches!(m, ReplMessage::Nop { .. })),
        "old replica got {leftovers:?}"
    );

    node.set("after", b"2").await;
    let ReplMessage::Sarc { key: sent, .. } = second.next_non_nop().await else {
        panic!("expected a sarc");
    };
    assert_eq!(sent, key("after"));
    assert!(node.master.is_attached());
}

#[tokio::test]
async fn test_replica_disconnect_detaches() {
    let node = TestNode::start(config(1)).await;
    let replica = node.attach_replica().await;
    let mut attached = node.master.subscribe_attached();
    assert!(attached.borrow().is_some());

    drop(replica);
    attached
        .wait_for(Option::is_none)
        .await
        .expect("master should still be alive");
    assert!(!node.master.is_attached());

    // Mutations still apply locally with nobody to forward to.
    node.set("k", b"v").await;
    assert_eq!(
        node.store.get(&key("k")).expect("should read").map(|v| v.data),
        Some(b"v".to_vec())
    );
}
