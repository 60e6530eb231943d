use std::alloc::System;
use std::hint::black_box;

use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};
use streamfold::queue::{self, Poll};
use streamfold::registry::{SelectorPolicy, WorkerSelector};
use streamfold::roles::ServiceMetric;
use streamfold::schema::{Record, Row, StorageId, TimeBucket};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn service_delta(entity: &str, calls: i64, duration: i64) -> Row {
    let bucket = TimeBucket::new(202_401_010_930).expect("valid bucket");
    let mut record = ServiceMetric::new(StorageId::new(bucket, entity));
    record.service_id = 7;
    record.application_id = 1;
    record.calls = calls;
    record.duration_sum = duration;
    record.satisfied_count = calls;
    record.latest_call_time = duration;
    record.to_row()
}

#[test]
#[serial]
fn schema_fold_allocates_zero() {
    let schema = ServiceMetric::schema();
    let mut buffered = service_delta("7", 1, 120);
    let deltas: Vec<Row> = (0..256).map(|i| service_delta("7", 1, 100 + i)).collect();

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for delta in &deltas {
            black_box(schema.fold(&mut buffered, delta));
        }
    });

    assert_eq!(allocations, 0, "fold allocated {allocations} times");
    assert_eq!(deallocations, 0, "fold deallocated {deallocations} times");

    let merged = ServiceMetric::from_row(&buffered).expect("decodes");
    assert_eq!(merged.calls, 257);
}

#[test]
#[serial]
fn consistent_hash_select_allocates_zero() {
    let selector = WorkerSelector::new(SelectorPolicy::ConsistentHash, 8);
    let entities: Vec<String> = (0..512).map(|i| format!("svc-{i}")).collect();

    let (_, allocations, _) = measure_alloc_counts(|| {
        for entity in &entities {
            black_box(selector.select(entity));
        }
    });

    assert_eq!(allocations, 0, "select allocated {allocations} times");
}

#[test]
#[serial]
fn queue_round_trip_allocation_budget() {
    let (producer, mut consumer) = queue::bounded::<Row>(256).expect("capacity");
    let rows: Vec<Row> = (0..256).map(|i| service_delta("7", 1, i)).collect();

    let (received, allocations, _) = measure_alloc_counts(move || {
        let mut received = Vec::with_capacity(256);
        for row in rows {
            producer.publish(row).expect("queue open");
        }
        while let Poll::Item { value, .. } = consumer.poll_timeout(std::time::Duration::ZERO) {
            received.push(value);
        }
        received
    });

    assert_eq!(received.len(), 256);
    // Only the receiving vector itself.
    assert!(
        allocations <= 1,
        "queue round trip allocation budget exceeded: {}",
        allocations
    );
}
