//! Increments and decrements travel as distinct messages.

use super::helpers::{TestNode, config, key};
use crate::replication::mutation::{IncrDecrKind, Mutation};
use crate::replication::protocol::{MessageCode, ReplMessage};
use crate::store::{IncrDecrResult, MutationResult};

#[tokio::test]
async fn test_incr_and_decr_forwarded_with_their_own_codes() {
    let node = TestNode::start(config(2)).await;
    let mut replica = node.attach_replica().await;
    node.set("counter", b"10").await;

    let incr = node
        .submit(Mutation::IncrDecr {
            kind: IncrDecrKind::Incr,
            key: key("counter"),
            amount: 5,
        })
        .await;
    assert_eq!(incr, MutationResult::IncrDecr(IncrDecrResult::Success(15)));
    let decr = node
        .submit(Mutation::IncrDecr {
            kind: IncrDecrKind::Decr,
            key: key("counter"),
            amount: 20,
        })
        .await;
    assert_eq!(decr, MutationResult::IncrDecr(IncrDecrResult::Success(0)));

    assert!(matches!(replica.next_non_nop().await, ReplMessage::Sarc { .. }));
    let incr_message = replica.next_non_nop().await;
    let decr_message = replica.next_non_nop().await;
    assert_eq!(incr_message.code(), MessageCode::Incr);
    assert_eq!(decr_message.code(), MessageCode::Decr);
    assert!(matches!(
        decr_message,
        ReplMessage::IncrDecr {
            kind: IncrDecrKind::Decr,
            amount: 20,
            ..
        }
    ));
}
