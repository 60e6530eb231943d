//! Storage seams: the persistence DAO a shard writes through, and the
//! identity DAO behind the identity caches.

pub mod memory;

use thiserror::Error;

use crate::schema::{Row, StorageId};

pub use memory::{MemoryIdentityDao, MemoryStore, MemoryTable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaoError {
    #[error("row not found")]
    NotFound,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out")]
    Timeout,
}

/// Reads and writes aggregated rows of one role.
pub trait PersistenceDao: Send + Sync {
    /// Fetches the stored row. `Ok(None)` and `Err(DaoError::NotFound)` both
    /// mean nothing is stored yet.
    fn get(&self, id: &StorageId) -> Result<Option<Row>, DaoError>;

    /// Inserts or replaces the row with the same storage id.
    fn write(&self, row: &Row) -> Result<(), DaoError>;
}

/// Resolves a natural key (an application code, a service name) to its
/// identity.
pub trait IdentityResolverDao<K, V>: Send + Sync {
    /// Returns the unresolved sentinel (`0`, `""`) when the key has no
    /// identity yet.
    fn resolve(&self, key: &K) -> Result<V, DaoError>;
}
