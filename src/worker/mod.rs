//! Per-shard persistence worker.
//!
//! A worker owns an in-memory buffer keyed by storage id. Deltas fold into
//! the buffer as they arrive; on a flush trigger every buffered row is,
//! optionally, merged with the stored row and written. A row leaves the
//! buffer only once its write succeeds.

mod shard;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::{Counter, Gauge, Histogram};
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::registry::{Role, Topology};
use crate::schema::{Row, Schema, StorageId};
use crate::storage::{DaoError, PersistenceDao};

pub use shard::{spawn_shard, ShardHandle};

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The queue had nothing more published after the last delta.
    EndOfBatch,
    /// The periodic flush interval elapsed.
    Timer,
    /// The queue closed; final flush.
    Shutdown,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndOfBatch => "end_of_batch",
            Self::Timer => "timer",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub read_failures: usize,
    pub write_failures: usize,
    /// Rows still buffered after the flush.
    pub retained: usize,
}

impl FlushReport {
    pub fn failed(&self) -> bool {
        self.read_failures > 0 || self.write_failures > 0
    }
}

/// Prometheus handles pre-bound to one role and shard.
#[derive(Clone)]
pub struct WorkerMetrics {
    rows_written: Counter,
    read_errors: Counter,
    write_errors: Counter,
    conflicts: Counter,
    flush_duration: Histogram,
    buffered: Gauge,
}

impl WorkerMetrics {
    pub fn new(health: &HealthMetrics, role: &Role, shard: usize) -> Self {
        let role = role.as_str();
        let shard = shard.to_string();
        Self {
            rows_written: health.rows_written.with_label_values(&[role]),
            read_errors: health.flush_errors.with_label_values(&[role, "read"]),
            write_errors: health.flush_errors.with_label_values(&[role, "write"]),
            conflicts: health.non_column_conflicts.with_label_values(&[role]),
            flush_duration: health.flush_duration.with_label_values(&[role]),
            buffered: health.buffered_rows.with_label_values(&[role, shard.as_str()]),
        }
    }
}

/// Buffers and persists the rows of one shard of one role.
pub struct PersistenceWorker {
    role: Role,
    shard: usize,
    schema: Arc<Schema>,
    dao: Arc<dyn PersistenceDao>,
    need_merge_with_storage: bool,
    buffer: HashMap<StorageId, Row>,
    /// End-of-batch flushes are skipped until this instant after a failed
    /// flush, leaving retries to the timer.
    retry_after: Option<Instant>,
    retry_delay: Duration,
    metrics: WorkerMetrics,
}

impl PersistenceWorker {
    pub fn new(
        topology: &Topology,
        shard: usize,
        dao: Arc<dyn PersistenceDao>,
        retry_delay: Duration,
        metrics: WorkerMetrics,
    ) -> Self {
        Self {
            role: topology.role().clone(),
            shard,
            schema: Arc::clone(topology.schema()),
            dao,
            need_merge_with_storage: topology.need_merge_with_storage(),
            buffer: HashMap::new(),
            retry_after: None,
            retry_delay,
            metrics,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// The buffered row for `id`, if any.
    pub fn buffered_row(&self, id: &StorageId) -> Option<&Row> {
        self.buffer.get(id)
    }

    /// Folds one delta into the buffer.
    ///
    /// # Panics
    ///
    /// Panics when the row does not match the role's schema.
    pub fn on_message(&mut self, mut row: Row) {
        assert!(
            self.schema.matches(&row),
            "delta {} does not match schema {}",
            row.id(),
            self.schema.name()
        );

        if let Some(existing) = self.buffer.get_mut(row.id()) {
            let report = self.schema.fold(existing, &row);
            if report.conflicts > 0 {
                self.metrics.conflicts.inc_by(report.conflicts as f64);
            }
        } else {
            self.schema.apply_formulas(&mut row);
            self.buffer.insert(row.id().clone(), row);
            self.metrics.buffered.set(self.buffer.len() as f64);
        }
    }

    /// Handles a flush trigger. Returns `None` when the flush was skipped.
    ///
    /// Timer and shutdown triggers always flush. End-of-batch triggers are
    /// skipped while a failed flush is waiting for its retry delay.
    pub fn on_flush_trigger(&mut self, trigger: Trigger) -> Option<FlushReport> {
        if trigger == Trigger::EndOfBatch {
            if let Some(after) = self.retry_after {
                if Instant::now() < after {
                    return None;
                }
            }
        }

        let report = self.flush();
        debug!(
            role = %self.role,
            shard = self.shard,
            trigger = trigger.as_str(),
            written = report.written,
            retained = report.retained,
            "flushed shard buffer",
        );
        Some(report)
    }

    /// Writes every buffered row. Rows whose read or write fails stay
    /// buffered for the next flush.
    pub fn flush(&mut self) -> FlushReport {
        if self.buffer.is_empty() {
            return FlushReport::default();
        }

        let _timer = self.metrics.flush_duration.start_timer();
        let mut report = FlushReport::default();

        let Self {
            role,
            shard,
            schema,
            dao,
            need_merge_with_storage,
            buffer,
            metrics,
            ..
        } = self;

        buffer.retain(|id, row| {
            let merged;
            let to_write = if *need_merge_with_storage {
                match dao.get(id) {
                    Ok(Some(mut stored)) => {
                        let fold = schema.fold(&mut stored, row);
                        if fold.conflicts > 0 {
                            metrics.conflicts.inc_by(fold.conflicts as f64);
                        }
                        merged = stored;
                        &merged
                    }
                    Ok(None) | Err(DaoError::NotFound) => &*row,
                    Err(e) => {
                        report.read_failures += 1;
                        metrics.read_errors.inc();
                        warn!(
                            role = %role,
                            shard = *shard,
                            storage_id = %id,
                            error = %e,
                            "reading stored row failed, keeping delta buffered",
                        );
                        return true;
                    }
                }
            } else {
                &*row
            };

            match dao.write(to_write) {
                Ok(()) => {
                    report.written += 1;
                    false
                }
                Err(e) => {
                    report.write_failures += 1;
                    metrics.write_errors.inc();
                    warn!(
                        role = %role,
                        shard = *shard,
                        storage_id = %id,
                        error = %e,
                        "writing row failed, keeping delta buffered",
                    );
                    true
                }
            }
        });

        report.retained = self.buffer.len();
        self.metrics.rows_written.inc_by(report.written as f64);
        self.metrics.buffered.set(report.retained as f64);
        self.retry_after = report
            .failed()
            .then(|| Instant::now() + self.retry_delay);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Operation, SemanticType, Value};
    use crate::registry::{RoleDefinition, RoleRegistry, TopologySettings};
    use crate::schema::TimeBucket;
    use crate::storage::MemoryTable;
    use parking_lot::Mutex;

    fn registry(need_merge: bool) -> RoleRegistry {
        let schema = Schema::builder("calls")
            .column("service_id", SemanticType::Integer, Operation::Non)
            .column("calls", SemanticType::Long, Operation::Add)
            .column("status", SemanticType::String, Operation::Cover)
            .build()
            .expect("valid schema");
        let mut registry = RoleRegistry::default();
        registry
            .register(
                RoleDefinition {
                    role: Role::new("calls"),
                    schema: Arc::new(schema),
                },
                TopologySettings {
                    shards: 1,
                    need_merge_with_storage: Some(need_merge),
                    ..Default::default()
                },
            )
            .expect("valid role");
        registry
    }

    fn worker(registry: &RoleRegistry, dao: Arc<dyn PersistenceDao>) -> PersistenceWorker {
        let topology = registry.topology(&Role::new("calls")).expect("registered");
        let health = HealthMetrics::new(":0").expect("metrics");
        PersistenceWorker::new(
            topology,
            0,
            dao,
            Duration::from_secs(60),
            WorkerMetrics::new(&health, topology.role(), 0),
        )
    }

    fn storage_id() -> StorageId {
        StorageId::new(TimeBucket::new(202_401_151_030).expect("valid"), "9")
    }

    fn delta(registry: &RoleRegistry, calls: i64, status: &str) -> Row {
        let schema = registry
            .topology(&Role::new("calls"))
            .expect("registered")
            .schema();
        let mut row = schema.new_row(storage_id());
        schema.set(&mut row, "service_id", Value::Integer(9)).expect("set");
        schema.set(&mut row, "calls", Value::Long(calls)).expect("set");
        schema
            .set(&mut row, "status", Value::String(status.into()))
            .expect("set");
        row
    }

    fn stored_calls(registry: &RoleRegistry, table: &MemoryTable) -> Option<Value> {
        let schema = registry
            .topology(&Role::new("calls"))
            .expect("registered")
            .schema();
        table.row(&storage_id()).and_then(|row| schema.get(&row, "calls"))
    }

    /// Wraps a table and fails reads or writes on demand.
    struct Flaky {
        inner: MemoryTable,
        fail_reads: Mutex<Option<DaoError>>,
        fail_writes: Mutex<Option<DaoError>>,
    }

    impl Flaky {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryTable::new(),
                fail_reads: Mutex::new(None),
                fail_writes: Mutex::new(None),
            })
        }
    }

    impl PersistenceDao for Flaky {
        fn get(&self, id: &StorageId) -> Result<Option<Row>, DaoError> {
            match self.fail_reads.lock().clone() {
                Some(e) => Err(e),
                None => self.inner.get(id),
            }
        }

        fn write(&self, row: &Row) -> Result<(), DaoError> {
            match self.fail_writes.lock().clone() {
                Some(e) => Err(e),
                None => self.inner.write(row),
            }
        }
    }

    #[test]
    fn test_merge_with_storage_across_flushes() {
        let registry = registry(true);
        let table = Arc::new(MemoryTable::new());
        let mut worker = worker(&registry, table.clone());

        worker.on_message(delta(&registry, 2, "200"));
        worker.on_message(delta(&registry, 3, "200"));
        assert_eq!(worker.buffered(), 1);

        let report = worker.flush();
        assert_eq!(report.written, 1);
        assert_eq!(worker.buffered(), 0);
        assert_eq!(stored_calls(&registry, &table), Some(Value::Long(5)));

        worker.on_message(delta(&registry, 5, "500"));
        worker.flush();
        assert_eq!(stored_calls(&registry, &table), Some(Value::Long(10)));

        let schema = registry.topology(&Role::new("calls")).expect("registered").schema();
        let row = table.row(&storage_id()).expect("stored");
        assert_eq!(schema.get(&row, "status"), Some(Value::String("500".into())));
    }

    #[test]
    fn test_without_merge_overwrites_stored_row() {
        let registry = registry(false);
        let table = Arc::new(MemoryTable::new());
        let mut worker = worker(&registry, table.clone());

        worker.on_message(delta(&registry, 4, "200"));
        worker.flush();
        worker.on_message(delta(&registry, 1, "200"));
        worker.flush();

        assert_eq!(stored_calls(&registry, &table), Some(Value::Long(1)));
        assert_eq!(table.writes(), 2);
    }

    #[test]
    fn test_not_found_is_empty_baseline() {
        struct Missing(MemoryTable);
        impl PersistenceDao for Missing {
            fn get(&self, _id: &StorageId) -> Result<Option<Row>, DaoError> {
                Err(DaoError::NotFound)
            }
            fn write(&self, row: &Row) -> Result<(), DaoError> {
                self.0.write(row)
            }
        }

        let registry = registry(true);
        let dao = Arc::new(Missing(MemoryTable::new()));
        let mut worker = worker(&registry, dao.clone());
        worker.on_message(delta(&registry, 6, "200"));

        let report = worker.flush();
        assert_eq!(report.written, 1);
        assert_eq!(stored_calls(&registry, &dao.0), Some(Value::Long(6)));
    }

    #[test]
    fn test_read_failure_keeps_row_buffered() {
        let registry = registry(true);
        let dao = Flaky::new();
        let mut worker = worker(&registry, dao.clone());

        *dao.fail_reads.lock() = Some(DaoError::Timeout);
        worker.on_message(delta(&registry, 2, "200"));
        let report = worker.flush();
        assert_eq!(report.read_failures, 1);
        assert_eq!(report.retained, 1);
        assert!(dao.inner.is_empty());

        *dao.fail_reads.lock() = None;
        worker.on_message(delta(&registry, 3, "200"));
        let report = worker.flush();
        assert_eq!(report.written, 1);
        assert_eq!(stored_calls(&registry, &dao.inner), Some(Value::Long(5)));
    }

    #[test]
    fn test_write_failure_keeps_row_buffered() {
        let registry = registry(true);
        let dao = Flaky::new();
        let mut worker = worker(&registry, dao.clone());

        *dao.fail_writes.lock() = Some(DaoError::Unavailable("disk full".into()));
        worker.on_message(delta(&registry, 2, "200"));
        assert_eq!(worker.flush().write_failures, 1);
        assert_eq!(worker.buffered(), 1);

        *dao.fail_writes.lock() = None;
        assert_eq!(worker.flush().written, 1);
        assert_eq!(stored_calls(&registry, &dao.inner), Some(Value::Long(2)));
    }

    #[test]
    fn test_end_of_batch_skipped_during_retry_delay() {
        let registry = registry(true);
        let dao = Flaky::new();
        let mut worker = worker(&registry, dao.clone());

        *dao.fail_writes.lock() = Some(DaoError::Timeout);
        worker.on_message(delta(&registry, 1, "200"));
        let first = worker
            .on_flush_trigger(Trigger::EndOfBatch)
            .expect("first flush runs");
        assert!(first.failed());

        *dao.fail_writes.lock() = None;
        assert_eq!(worker.on_flush_trigger(Trigger::EndOfBatch), None);

        let timer = worker
            .on_flush_trigger(Trigger::Timer)
            .expect("timer always flushes");
        assert_eq!(timer.written, 1);
        assert!(worker
            .on_flush_trigger(Trigger::EndOfBatch)
            .is_some());
    }

    #[test]
    #[should_panic(expected = "does not match schema")]
    fn test_foreign_row_panics() {
        let registry = registry(true);
        let mut worker = worker(&registry, Arc::new(MemoryTable::new()));
        let other = Schema::builder("other")
            .column("x", SemanticType::Long, Operation::Add)
            .build()
            .expect("valid schema");
        worker.on_message(other.new_row(storage_id()));
    }
}
