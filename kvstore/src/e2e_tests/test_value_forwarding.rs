//! The local store and the replica see the same value bytes.

use futures::stream;

use super::helpers::{TestNode, config, key};
use crate::replication::data_provider::DataProvider;
use crate::replication::mutation::{AddPolicy, AppendPrependKind, Mutation, ReplacePolicy};
use crate::replication::protocol::ReplMessage;
use crate::store::{AppendPrependResult, MutationResult, SetResult};

fn chunked(chunks: Vec<Vec<u8>>) -> DataProvider {
    let size = chunks.iter().map(Vec::len).sum();
    DataProvider::from_stream(size, stream::iter(chunks.into_iter().map(Ok)))
}

#[tokio::test]
async fn test_streamed_value_reaches_store_and_replica() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;
    let value: Vec<u8> = (0..=u8::MAX).cycle().take(300).collect();

    let result = node
        .submit(Mutation::Sarc {
            key: key("blob"),
            data: chunked(value.chunks(64).map(<[u8]>::to_vec).collect()),
            flags: 42,
            exptime: 0,
            add_policy: AddPolicy::Yes,
            replace_policy: ReplacePolicy::Yes,
            old_cas: 0,
        })
        .await;
    assert_eq!(result, MutationResult::Sarc(SetResult::Stored));

    let ReplMessage::Sarc {
        key: sent_key,
        value: sent,
        flags,
        ..
    } = replica.next_non_nop().await
    else {
        panic!("expected a sarc");
    };
    assert_eq!(sent_key, key("blob"));
    assert_eq!(flags, 42);
    assert_eq!(sent, value);

    let stored = node.store.get(&key("blob")).expect("should read").expect("should exist");
    assert_eq!(stored.data, value);
    assert_eq!(stored.flags, 42);
}

#[tokio::test]
async fn test_append_and_prepend_forward_their_suffix_and_prefix() {
    let node = TestNode::start(config(1)).await;
    let mut replica = node.attach_replica().await;
    node.set("greeting", b"hello").await;

    let append = node
        .submit(Mutation::AppendPrepend {
            kind: AppendPrependKind::Append,
            key: key("greeting"),
            data: chunked(vec![b", ".to_vec(), b"world".to_vec()]),
        })
        .await;
    assert_eq!(append, MutationResult::AppendPrepend(AppendPrependResult::Success));
    node.submit(Mutation::AppendPrepend {
        kind: AppendPrependKind::Prepend,
        key: key("greeting"),
        data: DataProvider::from_bytes(b">> ".to_vec()),
    })
    .await;

    assert!(matches!(replica.next_non_nop().await, ReplMessage::Sarc { .. }));
    let mut forwarded = Vec::new();
    for _ in 0..2 {
        let ReplMessage::AppendPrepend { kind, value, .. } = replica.next_non_nop().await else {
            panic!("expected an append or prepend");
        };
        forwarded.push((kind, value));
    }
    assert_eq!(
        forwarded,
        vec![
            (AppendPrependKind::Append, b", world".to_vec()),
            (AppendPrependKind::Prepend, b">> ".to_vec()),
        ]
    );
    assert_eq!(
        node.store.get(&key("greeting")).expect("should read").map(|v| v.data),
        Some(b">> hello, world".to_vec())
    );
}
