//! Sharded stream-aggregation pipeline.
//!
//! Producers emit partial rows ("deltas") per role. Each role is routed to a
//! fixed set of shards through a bounded dispatch queue; the shard worker
//! folds deltas by storage id and periodically merges them into storage.

pub mod cache;
pub mod collector;
pub mod config;
pub mod export;
pub mod listener;
pub mod merge;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod roles;
pub mod schema;
pub mod storage;
pub mod worker;
