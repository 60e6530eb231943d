use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use xxhash_rust::xxh3::xxh3_64;

/// How deltas of a role are spread across its shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorPolicy {
    /// Cycle through shards. Only valid when every column is write-once.
    RoundRobin,
    /// `hash(entity_id) mod shards`. Every delta of an entity lands on the
    /// same shard, which keeps `Add` and `Cover` folds local to one worker.
    ConsistentHash,
}

impl SelectorPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::ConsistentHash => "consistent_hash",
        }
    }
}

/// Stable 64-bit hash of an entity id.
///
/// Fixed seed, so the same id maps to the same shard across restarts and
/// processes.
#[inline]
pub fn stable_hash(entity_id: &str) -> u64 {
    xxh3_64(entity_id.as_bytes())
}

/// Picks the shard for a delta.
#[derive(Debug)]
pub enum WorkerSelector {
    RoundRobin { shards: usize, next: AtomicUsize },
    ConsistentHash { shards: usize },
}

impl WorkerSelector {
    /// # Panics
    ///
    /// Panics when `shards` is zero; the registry rejects that first.
    pub fn new(policy: SelectorPolicy, shards: usize) -> Self {
        assert!(shards > 0, "worker selector needs at least one shard");
        match policy {
            SelectorPolicy::RoundRobin => Self::RoundRobin {
                shards,
                next: AtomicUsize::new(0),
            },
            SelectorPolicy::ConsistentHash => Self::ConsistentHash { shards },
        }
    }

    pub fn policy(&self) -> SelectorPolicy {
        match self {
            Self::RoundRobin { .. } => SelectorPolicy::RoundRobin,
            Self::ConsistentHash { .. } => SelectorPolicy::ConsistentHash,
        }
    }

    pub fn shard_count(&self) -> usize {
        match self {
            Self::RoundRobin { shards, .. } | Self::ConsistentHash { shards } => *shards,
        }
    }

    /// Shard index in `[0, shard_count)`.
    #[inline]
    pub fn select(&self, entity_id: &str) -> usize {
        match self {
            Self::RoundRobin { shards, next } => next.fetch_add(1, Ordering::Relaxed) % shards,
            Self::ConsistentHash { shards } => {
                // usize is at most 64 bits, so the remainder always fits.
                (stable_hash(entity_id) % *shards as u64) as usize
            }
        }
    }
}
