//! Mutation visitor that feeds the master.
//!
//! The frontend passes every stamped mutation through
//! [`MasterDispatcher::dispatch_change`] while still holding the clock lock.
//! The dispatcher queues a copy for the master and hands back the copy the
//! local store should apply. Value-carrying mutations have their provider
//! split so the store and the replica each read the full value.

use std::sync::Arc;

use crate::replication::data_provider::BufferBorrowingProvider;
use crate::replication::master::Master;
use crate::replication::mutation::Mutation;
use crate::timestamp::CasTime;

#[derive(Debug, Clone, Default)]
pub struct MasterDispatcher {
    master: Option<Arc<Master>>,
}

impl MasterDispatcher {
    #[must_use]
    pub const fn new(master: Arc<Master>) -> Self {
        Self {
            master: Some(master),
        }
    }

    /// A dispatcher that forwards nothing.
    #[must_use]
    pub const fn detached() -> Self {
        Self { master: None }
    }

    /// Queue `mutation` for replication and return the copy to apply locally.
    pub fn dispatch_change(&self, mutation: Mutation, castime: CasTime) -> Mutation {
        let Some(master) = &self.master else {
            return mutation;
        };

        match mutation {
            Mutation::GetCas { key } => {
                master.queue_forward(Mutation::GetCas { key: key.clone() }, castime);
                Mutation::GetCas { key }
            }
            Mutation::Sarc {
                key,
                data,
                flags,
                exptime,
                add_policy,
                replace_policy,
                old_cas,
            } => {
                let (local, side) = BufferBorrowingProvider::split(data);
                master.queue_forward(
                    Mutation::Sarc {
                        key: key.clone(),
                        data: side,
                        flags,
                        exptime,
                        add_policy,
                        replace_policy,
                        old_cas,
                    },
                    castime,
                );
                Mutation::Sarc {
                    key,
                    data: local,
                    flags,
                    exptime,
                    add_policy,
                    replace_policy,
                    old_cas,
                }
            }
            Mutation::IncrDecr { kind, key, amount } => {
                master.queue_forward(
                    Mutation::IncrDecr {
                        kind,
                        key: key.clone(),
                        amount,
                    },
                    castime,
                );
                Mutation::IncrDecr { kind, key, amount }
            }
            Mutation::AppendPrepend { kind, key, data } => {
                let (local, side) = BufferBorrowingProvider::split(data);
                master.queue_forward(
                    Mutation::AppendPrepend {
                        kind,
                        key: key.clone(),
                        data: side,
                    },
                    castime,
                );
                Mutation::AppendPrepend {
                    kind,
                    key,
                    data: local,
                }
            }
            Mutation::Delete { key } => {
                master.queue_forward(Mutation::Delete { key: key.clone() }, castime);
                Mutation::Delete { key }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::StoreKey;
    use crate::timestamp::ReplTimestamp;

    #[tokio::test]
    async fn test_detached_dispatcher_returns_mutation_unchanged() {
        let dispatcher = MasterDispatcher::detached();
        let key = StoreKey::try_from("k").expect("valid key");
        let castime = CasTime::new(1, ReplTimestamp::new(5));

        let returned =
            dispatcher.dispatch_change(Mutation::set(key.clone(), b"v".to_vec(), 0, 0), castime);
        let Mutation::Sarc {
            key: returned_key,
            data,
            ..
        } = returned
        else {
            panic!("expected a sarc");
        };
        assert_eq!(returned_key, key);
        assert_eq!(data.read_all().await, Ok(b"v".to_vec()));
    }
}
