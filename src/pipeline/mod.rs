//! Routes deltas from listeners to shard workers.
//!
//! Every role gets `shards` bounded queues, each drained by one worker
//! thread. The role's selector picks the queue for a delta, so with the
//! consistent-hash policy all deltas of one entity land on the same worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::queue::{self, Closed, Producer, Published, QueueError};
use crate::registry::{Role, RoleRegistry, Topology};
use crate::schema::{Record, Row};
use crate::storage::PersistenceDao;
use crate::worker::{spawn_shard, PersistenceWorker, ShardHandle, WorkerMetrics};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("creating queue for role {role}: {source}")]
    Queue {
        role: Role,
        #[source]
        source: QueueError,
    },

    #[error("spawning shard {shard} of role {role}: {source}")]
    Spawn {
        role: Role,
        shard: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error("no role registered as {0}")]
    UnknownRole(Role),

    /// The pipeline is shutting down; the delta is handed back.
    #[error("pipeline is closed")]
    Closed(Row),

    /// The shard thread died while the pipeline was running.
    #[error("shard {shard} of role {role} has stopped")]
    ShardDown { role: Role, shard: usize, row: Row },
}

struct Lane {
    producers: Vec<Producer<Row>>,
    dispatched: prometheus::Counter,
    blocked: prometheus::Counter,
}

/// Running set of shard workers for every registered role.
pub struct Pipeline {
    registry: Arc<RoleRegistry>,
    lanes: HashMap<Role, Lane>,
    handles: Mutex<Vec<ShardHandle>>,
    stopping: AtomicBool,
}

impl Pipeline {
    /// Starts one worker thread per shard of every role.
    ///
    /// `dao_for` supplies the storage of each role.
    pub fn start<F>(
        registry: Arc<RoleRegistry>,
        mut dao_for: F,
        flush_interval: Duration,
        health: &HealthMetrics,
    ) -> Result<Self, PipelineError>
    where
        F: FnMut(&Topology) -> Arc<dyn PersistenceDao>,
    {
        let mut lanes = HashMap::with_capacity(registry.len());
        let mut handles = Vec::new();

        for topology in registry.iter() {
            let role = topology.role();
            let dao = dao_for(topology);
            let mut producers = Vec::with_capacity(topology.shards());

            for shard in 0..topology.shards() {
                let (producer, consumer) =
                    queue::bounded(topology.queue_capacity()).map_err(|source| {
                        PipelineError::Queue {
                            role: role.clone(),
                            source,
                        }
                    })?;

                let worker = PersistenceWorker::new(
                    topology,
                    shard,
                    Arc::clone(&dao),
                    flush_interval,
                    WorkerMetrics::new(health, role, shard),
                );
                let handle = spawn_shard(
                    worker,
                    consumer,
                    flush_interval,
                    health.shards_running.clone(),
                )
                .map_err(|source| PipelineError::Spawn {
                    role: role.clone(),
                    shard,
                    source,
                })?;

                producers.push(producer);
                handles.push(handle);
            }

            debug!(role = %role, shards = producers.len(), "role lane started");
            lanes.insert(
                role.clone(),
                Lane {
                    producers,
                    dispatched: health.deltas_dispatched.with_label_values(&[role.as_str()]),
                    blocked: health.dispatch_blocked.with_label_values(&[role.as_str()]),
                },
            );
        }

        info!(
            roles = lanes.len(),
            shards = handles.len(),
            flush_interval = ?flush_interval,
            "pipeline started",
        );

        Ok(Self {
            registry,
            lanes,
            handles: Mutex::new(handles),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<RoleRegistry> {
        &self.registry
    }

    /// Routes one delta to the shard its entity maps to. Blocks while that
    /// shard's queue is full.
    ///
    /// # Panics
    ///
    /// Panics when `row` does not match the role's schema.
    pub fn dispatch(&self, role: &Role, row: Row) -> Result<(), DispatchError> {
        let (Some(topology), Some(lane)) = (self.registry.get(role), self.lanes.get(role)) else {
            return Err(DispatchError::UnknownRole(role.clone()));
        };

        assert!(
            topology.schema().matches(&row),
            "delta {} does not match schema of role {}",
            row.id(),
            role
        );

        let shard = topology.selector().select(row.id().entity_id());
        match lane.producers[shard].publish(row) {
            Ok(published) => {
                lane.dispatched.inc();
                if published == Published::AfterWait {
                    lane.blocked.inc();
                }
                Ok(())
            }
            Err(Closed(row)) if self.stopping.load(Ordering::Acquire) => {
                Err(DispatchError::Closed(row))
            }
            Err(Closed(row)) => {
                error!(role = %role, shard, "shard thread stopped while the pipeline is running");
                Err(DispatchError::ShardDown {
                    role: role.clone(),
                    shard,
                    row,
                })
            }
        }
    }

    /// Dispatches a typed record under its own role.
    pub fn dispatch_record<R: Record>(&self, record: &R) -> Result<(), DispatchError> {
        self.dispatch(&Role::new(R::ROLE), record.to_row())
    }

    /// Closes every queue and waits for the workers to drain and flush.
    /// Returns the number of rows still buffered after the final flushes.
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> usize {
        self.stopping.store(true, Ordering::Release);
        let handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return 0;
        }

        for lane in self.lanes.values() {
            for producer in &lane.producers {
                producer.close();
            }
        }

        let mut retained = 0;
        for handle in handles {
            match handle.join() {
                Ok(worker) => retained += worker.buffered(),
                Err(_) => warn!("shard thread panicked during shutdown"),
            }
        }

        if retained > 0 {
            warn!(retained, "rows left unflushed at shutdown");
        }
        info!("pipeline stopped");
        retained
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::{Operation, SemanticType, Value};
    use crate::registry::{RoleDefinition, TopologySettings};
    use crate::schema::{Schema, StorageId, TimeBucket};
    use crate::storage::MemoryStore;

    fn registry() -> Arc<RoleRegistry> {
        let schema = Schema::builder("hits")
            .column("hits", SemanticType::Long, Operation::Add)
            .build()
            .expect("valid schema");
        let mut registry = RoleRegistry::default();
        registry
            .register(
                RoleDefinition {
                    role: Role::new("hits"),
                    schema: Arc::new(schema),
                },
                TopologySettings {
                    shards: 3,
                    queue_capacity: 16,
                    ..Default::default()
                },
            )
            .expect("valid role");
        Arc::new(registry)
    }

    fn start(store: &MemoryStore) -> Pipeline {
        let health = HealthMetrics::new(":0").expect("metrics");
        Pipeline::start(
            registry(),
            |topology| store.table(topology.role()) as Arc<dyn PersistenceDao>,
            Duration::from_millis(20),
            &health,
        )
        .expect("pipeline starts")
    }

    fn delta(pipeline: &Pipeline, entity: &str, hits: i64) -> Row {
        let topology = pipeline.registry().topology(&Role::new("hits")).expect("role");
        let id = StorageId::new(TimeBucket::new(202_401_151_030).expect("valid"), entity);
        let mut row = topology.schema().new_row(id);
        topology
            .schema()
            .set(&mut row, "hits", Value::Long(hits))
            .expect("set");
        row
    }

    #[test]
    fn test_dispatch_folds_per_entity() {
        let store = MemoryStore::new();
        let pipeline = start(&store);
        let role = Role::new("hits");

        for entity in ["a", "b", "c", "d"] {
            for hits in 1..=5 {
                pipeline
                    .dispatch(&role, delta(&pipeline, entity, hits))
                    .expect("dispatched");
            }
        }
        assert_eq!(pipeline.shutdown(), 0);

        let table = store.table(&role);
        assert_eq!(table.len(), 4);
        let schema = pipeline.registry().topology(&role).expect("role").schema();
        for row in table.rows() {
            assert_eq!(schema.get(&row, "hits"), Some(Value::Long(15)));
        }
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let store = MemoryStore::new();
        let pipeline = start(&store);
        let row = delta(&pipeline, "a", 1);
        let err = pipeline
            .dispatch(&Role::new("missing"), row)
            .expect_err("unknown role");
        assert_eq!(err, DispatchError::UnknownRole(Role::new("missing")));
    }

    struct PanickingDao;

    impl PersistenceDao for PanickingDao {
        fn get(&self, _id: &StorageId) -> Result<Option<Row>, crate::storage::DaoError> {
            Ok(None)
        }

        fn write(&self, _row: &Row) -> Result<(), crate::storage::DaoError> {
            panic!("storage row is malformed");
        }
    }

    #[test]
    fn test_dead_shard_is_reported_to_dispatchers() {
        let health = HealthMetrics::new(":0").expect("metrics");
        let pipeline = Pipeline::start(
            registry(),
            |_| Arc::new(PanickingDao) as Arc<dyn PersistenceDao>,
            Duration::from_millis(20),
            &health,
        )
        .expect("pipeline starts");
        let role = Role::new("hits");

        let mut outcome = Ok(());
        for _ in 0..500 {
            outcome = pipeline.dispatch(&role, delta(&pipeline, "a", 1));
            if outcome.is_err() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        match outcome {
            Err(DispatchError::ShardDown { role: down, row, .. }) => {
                assert_eq!(down, role);
                assert_eq!(row.id().entity_id(), "a");
            }
            other => panic!("expected shard down, got {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_after_shutdown_returns_row() {
        let store = MemoryStore::new();
        let pipeline = start(&store);
        pipeline.shutdown();
        assert_eq!(pipeline.shutdown(), 0);

        let row = delta(&pipeline, "a", 1);
        match pipeline.dispatch(&Role::new("hits"), row.clone()) {
            Err(DispatchError::Closed(returned)) => assert_eq!(returned, row),
            other => panic!("expected closed, got {other:?}"),
        }
    }
}
