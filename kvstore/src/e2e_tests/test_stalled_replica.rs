//! A replica that is connected but has stopped reading.

use std::time::Duration;

use super::helpers::{TestNode, config, key};
use crate::replication::protocol::ReplMessage;

const STALLED_BUFFER: usize = 64;
const TEARDOWN_LIMIT: Duration = Duration::from_secs(10);

async fn fill_stalled_stream(node: &TestNode) {
    for i in 0..20 {
        node.set(&format!("key-{i}"), &[b'x'; 16]).await;
    }
    // Let the home context run into the full buffer.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_replacing_a_stalled_replica_completes() {
    let node = TestNode::start(config(2)).await;
    let _stalled = node.attach_replica_with_buffer(STALLED_BUFFER).await;
    fill_stalled_stream(&node).await;

    let mut second = tokio::time::timeout(TEARDOWN_LIMIT, node.attach_replica())
        .await
        .expect("replacement should not wait on the stalled replica");
    assert!(node.master.is_attached());

    node.set("after", b"1").await;
    loop {
        if let ReplMessage::Sarc { key: sent, .. } = second.next_non_nop().await {
            if sent == key("after") {
                break;
            }
        }
    }
}

#[tokio::test]
async fn test_shutdown_with_a_stalled_replica_completes() {
    let node = TestNode::start(config(2)).await;
    let _stalled = node.attach_replica_with_buffer(STALLED_BUFFER).await;
    fill_stalled_stream(&node).await;

    tokio::time::timeout(TEARDOWN_LIMIT, node.master.shutdown())
        .await
        .expect("shutdown should not wait on the stalled replica");
    assert!(!node.master.is_attached());
}
