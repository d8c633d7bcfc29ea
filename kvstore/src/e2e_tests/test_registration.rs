//! Binding the master to a store.

use std::sync::Arc;

use super::helpers::{TestNode, config};
use crate::store::{BtreeStore, KeyValueStore};

#[tokio::test]
#[should_panic(expected = "already registered")]
async fn test_second_store_registration_panics() {
    let node = TestNode::start(config(1)).await;
    let other: Arc<dyn KeyValueStore> = Arc::new(BtreeStore::new(1).expect("should create store"));
    let _ = node.master.register_key_value_store(other).await;
}

#[tokio::test]
async fn test_replica_connects_over_tcp() {
    let node = TestNode::start(config(1)).await;
    let store: Arc<dyn KeyValueStore> = Arc::new(BtreeStore::new(1).expect("should create store"));
    let master = crate::replication::Master::new(config(1), Arc::clone(&node.shards));
    let addr = master
        .register_key_value_store(store)
        .await
        .expect("should bind listener");

    let mut attached = master.subscribe_attached();
    let _socket = tokio::net::TcpStream::connect(("127.0.0.1", addr.port()))
        .await
        .expect("should connect");
    attached
        .wait_for(Option::is_some)
        .await
        .expect("master should still be alive");
    assert!(master.is_attached());
    master.shutdown().await;
}
