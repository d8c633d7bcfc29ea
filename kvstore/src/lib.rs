//! A sharded key-value store node that replicates to one replica.
//!
//! # Structure
//!
//! - [`storage`]: blocks, superblock and the B-tree node store
//! - [`store`]: memcached-style key-value store over per-shard B-trees
//! - [`shards`]: shard execution contexts
//! - [`frontend`]: routes, stamps and applies client mutations
//! - [`replication`]: the replication master and its wire protocol
//! - [`timestamp`]: replication timestamps and the shared clock

pub mod config;
pub mod frontend;
pub mod replication;
pub mod shards;
pub mod storage;
pub mod store;
pub mod time;
pub mod timestamp;

mod e2e_tests;
