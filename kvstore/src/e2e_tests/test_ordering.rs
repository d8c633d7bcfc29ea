//! Concurrent submissions reach the replica in timestamp order.

use std::collections::HashSet;

use tokio::task::JoinSet;

use super::helpers::{TestNode, config, key};
use crate::replication::mutation::Mutation;
use crate::timestamp::ReplTimestamp;

const WRITES: usize = 100;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writes_forwarded_in_timestamp_order() {
    let node = TestNode::start(config(4)).await;
    let mut replica = node.attach_replica().await;

    let mut writers = JoinSet::new();
    for i in 0..WRITES {
        let frontend = node.frontend.clone();
        writers.spawn(async move {
            let value = i.to_string().into_bytes();
            let mutation = Mutation::set(key(&format!("key-{i}")), value, 0, 0);
            frontend.submit(mutation).await.expect("should submit");
        });
    }

    let mut last = ReplTimestamp::DISTANT_PAST;
    let mut mutation_times = HashSet::new();
    while mutation_times.len() < WRITES {
        let message = replica.next_message().await;
        let timestamp = message.timestamp().expect("real-time messages carry a timestamp");
        assert!(timestamp >= last, "{timestamp} arrived after {last}");
        last = timestamp;
        if !matches!(message, crate::replication::ReplMessage::Nop { .. }) {
            assert!(mutation_times.insert(timestamp), "duplicate timestamp {timestamp}");
        }
    }

    while let Some(joined) = writers.join_next().await {
        joined.expect("writer should not panic");
    }
    assert_eq!(node.store.population().expect("should count"), 100);
}
