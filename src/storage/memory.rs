use std::hash::Hash;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{DaoError, IdentityResolverDao, PersistenceDao};
use crate::registry::Role;
use crate::schema::{Row, StorageId};

/// In-process row table for one role.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: DashMap<StorageId, Row>,
    writes: AtomicU64,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, id: &StorageId) -> Option<Row> {
        self.rows.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every row, ordered by storage id.
    pub fn rows(&self) -> Vec<Row> {
        let mut rows: Vec<Row> = self.rows.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| a.id().cmp(b.id()));
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of successful writes since creation.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl PersistenceDao for MemoryTable {
    fn get(&self, id: &StorageId) -> Result<Option<Row>, DaoError> {
        Ok(self.row(id))
    }

    fn write(&self, row: &Row) -> Result<(), DaoError> {
        self.rows.insert(row.id().clone(), row.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// One [`MemoryTable`] per role, created on first use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: DashMap<Role, Arc<MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, role: &Role) -> Arc<MemoryTable> {
        Arc::clone(self.tables.entry(role.clone()).or_default().value())
    }

    /// Total rows across all tables.
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.value().len()).sum()
    }
}

/// Identity table that hands out sequential ids.
///
/// In registering mode an unknown key is assigned the next id on first
/// lookup; otherwise unknown keys resolve to `0`.
#[derive(Debug)]
pub struct MemoryIdentityDao<K: Eq + Hash> {
    ids: DashMap<K, i32>,
    next: AtomicI32,
    register_unknown: bool,
}

impl<K: Eq + Hash + Clone> MemoryIdentityDao<K> {
    pub fn registering() -> Self {
        Self {
            ids: DashMap::new(),
            next: AtomicI32::new(1),
            register_unknown: true,
        }
    }

    pub fn lookup_only() -> Self {
        Self {
            register_unknown: false,
            ..Self::registering()
        }
    }

    /// Assigns an id to `key` if it has none and returns it.
    pub fn register(&self, key: K) -> i32 {
        *self
            .ids
            .entry(key)
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed))
            .value()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl<K> IdentityResolverDao<K, i32> for MemoryIdentityDao<K>
where
    K: Eq + Hash + Clone + Send + Sync,
{
    fn resolve(&self, key: &K) -> Result<i32, DaoError> {
        if let Some(id) = self.ids.get(key) {
            return Ok(*id.value());
        }
        if self.register_unknown {
            Ok(self.register(key.clone()))
        } else {
            Ok(0)
        }
    }
}
