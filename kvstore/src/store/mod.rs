//! The key-value store the frontend applies mutations to and the master
//! backfills from.
//!
//! # Usage
//!
//! ```ignore
//! let store: Arc<dyn KeyValueStore> = Arc::new(BtreeStore::new(4)?);
//! let result = store.apply(mutation, castime).await?;
//! ```

mod btree_store;

pub use btree_store::BtreeStore;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::replication::data_provider::DataError;
use crate::replication::mutation::Mutation;
use crate::storage::btree::{BTreeError, MemcachedValue, StoreKey, ValueError};
use crate::timestamp::{CasTime, ReplTimestamp};

/// Storage the replication master can be bound to.
pub trait KeyValueStore: Send + Sync {
    /// Apply one stamped mutation. Mutations for a key are applied in the
    /// order their callers submit them.
    fn apply(&self, mutation: Mutation, castime: CasTime)
    -> BoxFuture<'_, Result<MutationResult, StoreError>>;

    /// Stream every change at or after `since` into `sink`, finishing with
    /// [`BackfillEvent::Done`]. Production stops early if the receiver is dropped.
    fn spawn_backfill(
        self: Arc<Self>,
        since: ReplTimestamp,
        sink: mpsc::UnboundedSender<BackfillEvent>,
    );

    /// Drop remembered deletions older than `horizon`, once no replica can
    /// still need them. Returns how many were dropped.
    fn forget_deletions_before(&self, horizon: ReplTimestamp) -> usize;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillItem {
    Set {
        key: StoreKey,
        value: MemcachedValue,
        timestamp: ReplTimestamp,
    },
    Delete {
        key: StoreKey,
        timestamp: ReplTimestamp,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillEvent {
    Item(BackfillItem),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResult {
    Stored,
    /// Blocked by the add or replace policy.
    NotStored,
    /// CAS did not match.
    Exists,
    /// CAS requested on a missing key.
    NotFound,
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrDecrResult {
    Success(u64),
    NotFound,
    NotNumeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendPrependResult {
    Success,
    NotFound,
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationResult {
    /// The value with its (possibly newly assigned) CAS, or `None` if missing.
    GetCas(Option<MemcachedValue>),
    Sarc(SetResult),
    IncrDecr(IncrDecrResult),
    AppendPrepend(AppendPrependResult),
    Delete(DeleteResult),
}

#[derive(Debug)]
pub enum StoreError {
    Tree(BTreeError),
    Value(ValueError),
    Data(DataError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tree(e) => write!(f, "tree error: {e}"),
            Self::Value(e) => write!(f, "value error: {e}"),
            Self::Data(e) => write!(f, "value stream error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tree(e) => Some(e),
            Self::Value(e) => Some(e),
            Self::Data(e) => Some(e),
        }
    }
}

impl From<BTreeError> for StoreError {
    fn from(e: BTreeError) -> Self {
        Self::Tree(e)
    }
}

impl From<ValueError> for StoreError {
    fn from(e: ValueError) -> Self {
        Self::Value(e)
    }
}

impl From<DataError> for StoreError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}
