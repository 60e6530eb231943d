use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use prometheus::Gauge;
use tracing::info;

use super::{PersistenceWorker, Trigger};
use crate::queue::{Consumer, Poll};
use crate::schema::Row;

/// Join handle for a running shard thread. Joining returns the worker so
/// callers can inspect what is still buffered.
pub type ShardHandle = JoinHandle<PersistenceWorker>;

/// Runs `worker` on a dedicated thread, draining `consumer` until the queue
/// closes.
///
/// The buffer flushes when a delta ends a batch, when `flush_interval`
/// elapses, and once more after the queue is closed and drained.
pub fn spawn_shard(
    mut worker: PersistenceWorker,
    mut consumer: Consumer<Row>,
    flush_interval: Duration,
    running: Gauge,
) -> io::Result<ShardHandle> {
    let name = format!("{}-shard-{}", worker.role(), worker.shard());

    thread::Builder::new().name(name).spawn(move || {
        running.inc();
        let mut next_flush = Instant::now() + flush_interval;

        loop {
            let wait = next_flush.saturating_duration_since(Instant::now());
            match consumer.poll_timeout(wait) {
                Poll::Item {
                    value,
                    end_of_batch,
                } => {
                    worker.on_message(value);
                    if end_of_batch {
                        worker.on_flush_trigger(Trigger::EndOfBatch);
                    }
                }
                Poll::Idle => {}
                Poll::Closed => break,
            }

            if Instant::now() >= next_flush {
                worker.on_flush_trigger(Trigger::Timer);
                next_flush = Instant::now() + flush_interval;
            }
        }

        let report = worker.on_flush_trigger(Trigger::Shutdown).unwrap_or_default();
        info!(
            role = %worker.role(),
            shard = worker.shard(),
            written = report.written,
            retained = report.retained,
            "shard stopped",
        );
        running.dec();
        worker
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::export::health::HealthMetrics;
    use crate::merge::{Operation, SemanticType, Value};
    use crate::queue;
    use crate::registry::{Role, RoleDefinition, RoleRegistry, TopologySettings};
    use crate::schema::{Schema, StorageId, TimeBucket};
    use crate::storage::MemoryTable;
    use crate::worker::WorkerMetrics;

    #[test]
    fn test_shard_drains_and_flushes_on_close() {
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
                    shards: 1,
                    queue_capacity: 8,
                    ..Default::default()
                },
            )
            .expect("valid role");
        let topology = registry.topology(&Role::new("hits")).expect("registered");
        let health = HealthMetrics::new(":0").expect("metrics");
        let table = Arc::new(MemoryTable::new());

        let worker = PersistenceWorker::new(
            topology,
            0,
            table.clone(),
            Duration::from_millis(50),
            WorkerMetrics::new(&health, topology.role(), 0),
        );
        let (producer, consumer) = queue::bounded(8).expect("capacity");
        let handle = spawn_shard(
            worker,
            consumer,
            Duration::from_secs(3600),
            health.shards_running.clone(),
        )
        .expect("thread spawns");

        let id = StorageId::new(TimeBucket::new(202_401_151_030).expect("valid"), "e");
        for hits in [1, 2, 3, 4] {
            let mut row = topology.schema().new_row(id.clone());
            topology
                .schema()
                .set(&mut row, "hits", Value::Long(hits))
                .expect("set");
            producer.publish(row).expect("open");
        }
        producer.close();

        let worker = handle.join().expect("shard thread");
        assert_eq!(worker.buffered(), 0);
        let stored = table.row(&id).expect("written");
        assert_eq!(topology.schema().get(&stored, "hits"), Some(Value::Long(10)));
        assert_eq!(health.shards_running.get(), 0.0);
    }
}
