//! A watermark no-op waits for every shard to confirm.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use super::helpers::{TestNode, config, key_on_shard};
use crate::replication::mutation::Mutation;
use crate::replication::protocol::ReplMessage;
use crate::timestamp::ReplTimestamp;

#[tokio::test(start_paused = true)]
async fn test_nop_waits_for_busy_shard() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;

    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let shards = Arc::clone(&node.shards);
    let busy = tokio::spawn(async move {
        shards
            .run_on(1, move |_| async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .await
    });
    started_rx.await.expect("shard 1 should start the blocking job");

    node.time.set(5_000);
    let k = key_on_shard("k", 0, 2);
    node.submit(Mutation::set(k.clone(), b"v".to_vec(), 0, 0)).await;

    let ReplMessage::Sarc { key, timestamp, .. } = replica.next_message().await else {
        panic!("expected the sarc first");
    };
    assert_eq!((key, timestamp), (k, ReplTimestamp::new(5_000)));

    let early = tokio::time::timeout(Duration::from_millis(500), replica.recv()).await;
    assert!(early.is_err(), "no-op sent before shard 1 confirmed: {early:?}");

    release_tx.send(()).expect("blocking job should still be waiting");
    busy.await.expect("task should not panic").expect("blocking job should run");
    assert_eq!(
        replica.next_message().await,
        ReplMessage::Nop {
            timestamp: ReplTimestamp::new(5_000)
        }
    );
}
