//! Primary-to-replica replication.
//!
//! # Structure
//!
//! - [`master`]: connection lifecycle, watermark, heartbeat and backfill
//! - [`dispatcher`]: mutation visitor that queues copies for the master
//! - [`protocol`]: framed wire messages
//! - [`stream`]: whole-frame writer with a closed notification
//! - [`data_provider`]: streamed values and the buffering splitter
//! - [`mutation`]: the mutations being replicated

pub mod data_provider;
pub mod dispatcher;
mod hold;
pub mod master;
pub mod mutation;
pub mod protocol;
pub mod stream;
mod timer;

pub use data_provider::{BufferBorrowingProvider, DataError, DataProvider};
pub use dispatcher::MasterDispatcher;
pub use master::{BackfillError, Master, MasterError};
pub use mutation::{AddPolicy, AppendPrependKind, IncrDecrKind, Mutation, ReplacePolicy};
pub use protocol::{MessageCode, ProtocolError, ReplMessage};
pub use stream::{ReplStream, StreamError};
