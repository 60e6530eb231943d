//! Boundary between decoded telemetry and the pipeline.
//!
//! A [`ServiceCall`] is one call reported by an agent. The listener resolves
//! its identities, builds the minute rows of every call metric role plus
//! the segment record, and dispatches them. A call whose identities cannot
//! be resolved yet is parked instead of being stored under a made-up id.

use std::sync::Arc;
use std::time::Duration;

use prometheus::CounterVec;
use tracing::debug;

use crate::cache::{Identity, IdentityCache};
use crate::export::health::HealthMetrics;
use crate::pipeline::{DispatchError, Pipeline};
use crate::roles::{ApplicationMetric, InstanceMetric, SegmentCost, ServiceMetric};
use crate::schema::{StorageId, TimeBucket};

/// One decoded call reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCall {
    pub application_code: String,
    /// Agent instance uuid.
    pub instance_key: String,
    pub service_name: String,
    pub segment_id: String,
    pub start_time_ms: i64,
    pub duration_ms: i64,
    pub is_error: bool,
}

/// Why a call was held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkReason {
    ApplicationUnresolved,
    InstanceUnresolved,
    ServiceUnresolved,
    InvalidTimestamp,
    /// Negative call duration.
    InvalidDuration,
}

impl ParkReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApplicationUnresolved => "application_unresolved",
            Self::InstanceUnresolved => "instance_unresolved",
            Self::ServiceUnresolved => "service_unresolved",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::InvalidDuration => "invalid_duration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Dispatched,
    Parked(ParkReason),
}

/// Apdex classification of a call duration against threshold `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Apdex {
    /// At most `T`.
    Satisfied,
    /// At most `4T`.
    Tolerating,
    Frustrated,
}

impl Apdex {
    pub fn classify(duration_ms: i64, threshold: Duration) -> Self {
        let t = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        if duration_ms <= t {
            Self::Satisfied
        } else if duration_ms <= t.saturating_mul(4) {
            Self::Tolerating
        } else {
            Self::Frustrated
        }
    }
}

/// Identity caches the listener resolves through.
pub struct IdentityCaches {
    /// Application code to application id.
    pub application: IdentityCache<String, i32>,
    /// (application id, agent uuid) to instance id.
    pub instance: IdentityCache<(i32, String), i32>,
    /// (application id, service name) to service id.
    pub service: IdentityCache<(i32, String), i32>,
}

impl IdentityCaches {
    pub fn shutdown(&self) {
        self.application.shutdown();
        self.instance.shutdown();
        self.service.shutdown();
    }
}

/// Counters shared by the three call metric roles.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CallCounters {
    error_calls: i64,
    error_duration_sum: i64,
    satisfied: i64,
    tolerating: i64,
    frustrated: i64,
}

impl CallCounters {
    fn of(call: &ServiceCall, threshold: Duration) -> Self {
        let mut counters = Self::default();
        if call.is_error {
            counters.error_calls = 1;
            counters.error_duration_sum = call.duration_ms;
        }
        match Apdex::classify(call.duration_ms, threshold) {
            Apdex::Satisfied => counters.satisfied = 1,
            Apdex::Tolerating => counters.tolerating = 1,
            Apdex::Frustrated => counters.frustrated = 1,
        }
        counters
    }
}

/// Records built from one call, ready to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecords {
    pub application: ApplicationMetric,
    pub service: ServiceMetric,
    pub instance: InstanceMetric,
    pub segment: SegmentCost,
}

pub struct ServiceCallListener {
    caches: Arc<IdentityCaches>,
    pipeline: Arc<Pipeline>,
    apdex_threshold: Duration,
    parked: CounterVec,
}

impl ServiceCallListener {
    pub fn new(
        caches: Arc<IdentityCaches>,
        pipeline: Arc<Pipeline>,
        apdex_threshold: Duration,
        health: &HealthMetrics,
    ) -> Self {
        Self {
            caches,
            pipeline,
            apdex_threshold,
            parked: health.deltas_parked.clone(),
        }
    }

    /// Resolves identities and builds the records of one call.
    pub fn build(&self, call: &ServiceCall) -> Result<CallRecords, ParkReason> {
        let Ok(bucket) = TimeBucket::minute_from_millis(call.start_time_ms) else {
            return Err(ParkReason::InvalidTimestamp);
        };
        if call.duration_ms < 0 {
            return Err(ParkReason::InvalidDuration);
        }

        let application_id = self.caches.application.resolve(&call.application_code);
        if application_id.is_unresolved() {
            return Err(ParkReason::ApplicationUnresolved);
        }
        let instance_id = self
            .caches
            .instance
            .resolve(&(application_id, call.instance_key.clone()));
        if instance_id.is_unresolved() {
            return Err(ParkReason::InstanceUnresolved);
        }
        let service_id = self
            .caches
            .service
            .resolve(&(application_id, call.service_name.clone()));
        if service_id.is_unresolved() {
            return Err(ParkReason::ServiceUnresolved);
        }

        let counters = CallCounters::of(call, self.apdex_threshold);
        let latest = call.start_time_ms.saturating_add(call.duration_ms);

        let mut application =
            ApplicationMetric::new(StorageId::new(bucket, application_id.to_string()));
        application.application_id = application_id;
        application.calls = 1;
        application.error_calls = counters.error_calls;
        application.duration_sum = call.duration_ms;
        application.error_duration_sum = counters.error_duration_sum;
        application.satisfied_count = counters.satisfied;
        application.tolerating_count = counters.tolerating;
        application.frustrated_count = counters.frustrated;
        application.latest_call_time = latest;
        application.last_call_error = call.is_error;

        let mut service = ServiceMetric::new(StorageId::new(bucket, service_id.to_string()));
        service.service_id = service_id;
        service.application_id = application_id;
        service.calls = 1;
        service.error_calls = counters.error_calls;
        service.duration_sum = call.duration_ms;
        service.error_duration_sum = counters.error_duration_sum;
        service.satisfied_count = counters.satisfied;
        service.tolerating_count = counters.tolerating;
        service.frustrated_count = counters.frustrated;
        service.latest_call_time = latest;
        service.last_call_error = call.is_error;

        let mut instance = InstanceMetric::new(StorageId::new(bucket, instance_id.to_string()));
        instance.instance_id = instance_id;
        instance.application_id = application_id;
        instance.calls = 1;
        instance.error_calls = counters.error_calls;
        instance.duration_sum = call.duration_ms;
        instance.error_duration_sum = counters.error_duration_sum;
        instance.satisfied_count = counters.satisfied;
        instance.tolerating_count = counters.tolerating;
        instance.frustrated_count = counters.frustrated;
        instance.latest_call_time = latest;
        instance.last_call_error = call.is_error;

        let mut segment = SegmentCost::new(StorageId::new(bucket, call.segment_id.as_str()));
        segment.segment_id = call.segment_id.clone();
        segment.application_id = application_id;
        segment.service_name = call.service_name.clone();
        segment.cost = call.duration_ms;
        segment.is_error = call.is_error;
        segment.start_time = call.start_time_ms;

        Ok(CallRecords {
            application,
            service,
            instance,
            segment,
        })
    }

    /// Handles one decoded call.
    pub fn on_delta(&self, call: &ServiceCall) -> Result<Delivery, DispatchError> {
        let records = match self.build(call) {
            Ok(records) => records,
            Err(reason) => {
                self.parked.with_label_values(&[reason.as_str()]).inc();
                debug!(
                    application = %call.application_code,
                    service = %call.service_name,
                    reason = reason.as_str(),
                    "parked service call",
                );
                return Ok(Delivery::Parked(reason));
            }
        };

        self.pipeline.dispatch_record(&records.application)?;
        self.pipeline.dispatch_record(&records.service)?;
        self.pipeline.dispatch_record(&records.instance)?;
        self.pipeline.dispatch_record(&records.segment)?;
        Ok(Delivery::Dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheSettings;
    use crate::registry::RoleRegistry;
    use crate::roles;
    use crate::storage::{MemoryIdentityDao, MemoryStore, PersistenceDao};

    fn caches(health: &HealthMetrics, register: bool) -> Arc<IdentityCaches> {
        let app: MemoryIdentityDao<String> = if register {
            MemoryIdentityDao::registering()
        } else {
            MemoryIdentityDao::lookup_only()
        };
        Arc::new(IdentityCaches {
            application: IdentityCache::new(
                "application",
                Arc::new(app),
                CacheSettings::default(),
                health,
            ),
            instance: IdentityCache::new(
                "instance",
                Arc::new(MemoryIdentityDao::<(i32, String)>::registering()),
                CacheSettings::default(),
                health,
            ),
            service: IdentityCache::new(
                "service",
                Arc::new(MemoryIdentityDao::<(i32, String)>::registering()),
                CacheSettings::default(),
                health,
            ),
        })
    }

    fn listener(store: &MemoryStore, register: bool) -> ServiceCallListener {
        let health = HealthMetrics::new(":0").expect("metrics");
        let registry =
            RoleRegistry::from_source(&roles::schema_source(), |_| Default::default())
                .expect("valid registry");
        let pipeline = Pipeline::start(
            Arc::new(registry),
            |topology| store.table(topology.role()) as Arc<dyn PersistenceDao>,
            Duration::from_millis(20),
            &health,
        )
        .expect("pipeline starts");
        ServiceCallListener::new(
            caches(&health, register),
            Arc::new(pipeline),
            Duration::from_millis(500),
            &health,
        )
    }

    fn call(duration_ms: i64, is_error: bool) -> ServiceCall {
        ServiceCall {
            application_code: "shop".to_string(),
            instance_key: "agent-1".to_string(),
            service_name: "/checkout".to_string(),
            segment_id: format!("seg-{duration_ms}"),
            // 2024-01-01T09:30:00Z
            start_time_ms: 1_704_101_400_000,
            duration_ms,
            is_error,
        }
    }

    #[test]
    fn test_apdex_bands() {
        let t = Duration::from_millis(500);
        assert_eq!(Apdex::classify(500, t), Apdex::Satisfied);
        assert_eq!(Apdex::classify(501, t), Apdex::Tolerating);
        assert_eq!(Apdex::classify(2000, t), Apdex::Tolerating);
        assert_eq!(Apdex::classify(2001, t), Apdex::Frustrated);
    }

    #[test]
    fn test_build_fills_every_role() {
        let store = MemoryStore::new();
        let listener = listener(&store, true);
        let records = listener.build(&call(700, true)).expect("resolved");

        assert_eq!(records.service.storage_id.to_string(), "202401010930_1");
        assert_eq!(records.service.calls, 1);
        assert_eq!(records.service.tolerating_count, 1);
        assert_eq!(records.service.error_duration_sum, 700);
        assert_eq!(records.instance.application_id, 1);
        assert_eq!(records.application.latest_call_time, 1_704_101_400_700);
        assert_eq!(records.segment.storage_id.entity_id(), "seg-700");
        assert_eq!(records.segment.cost, 700);
    }

    #[test]
    fn test_unknown_application_is_parked() {
        let store = MemoryStore::new();
        let listener = listener(&store, false);
        let delivery = listener.on_delta(&call(10, false)).expect("no dispatch error");
        assert_eq!(delivery, Delivery::Parked(ParkReason::ApplicationUnresolved));
        assert_eq!(listener.pipeline.shutdown(), 0);
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn test_invalid_timestamp_is_parked() {
        let store = MemoryStore::new();
        let listener = listener(&store, true);
        let mut bad = call(10, false);
        bad.start_time_ms = i64::MAX;
        assert_eq!(
            listener.on_delta(&bad).expect("no dispatch error"),
            Delivery::Parked(ParkReason::InvalidTimestamp)
        );
    }

    #[test]
    fn test_negative_duration_is_parked() {
        let store = MemoryStore::new();
        let listener = listener(&store, true);
        assert_eq!(
            listener.on_delta(&call(-1, false)).expect("no dispatch error"),
            Delivery::Parked(ParkReason::InvalidDuration)
        );
        assert_eq!(listener.pipeline.shutdown(), 0);
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn test_huge_duration_saturates_latest_call_time() {
        let store = MemoryStore::new();
        let listener = listener(&store, true);
        let records = listener.build(&call(i64::MAX, false)).expect("resolved");

        assert_eq!(records.service.latest_call_time, i64::MAX);
        assert_eq!(records.application.latest_call_time, i64::MAX);
        assert_eq!(records.service.frustrated_count, 1);
        assert_eq!(records.segment.cost, i64::MAX);
    }

    #[test]
    fn test_calls_fold_into_one_service_row() {
        let store = MemoryStore::new();
        let listener = listener(&store, true);
        for duration in [100, 700, 3000] {
            assert_eq!(
                listener.on_delta(&call(duration, duration > 1000)).expect("dispatched"),
                Delivery::Dispatched
            );
        }
        assert_eq!(listener.pipeline.shutdown(), 0);

        let table = store.table(&crate::registry::Role::new("service_metric"));
        let rows = table.rows();
        assert_eq!(rows.len(), 1);
        let service = <ServiceMetric as crate::schema::Record>::from_row(&rows[0]).expect("decodes");
        assert_eq!(service.calls, 3);
        assert_eq!(service.duration_sum, 3800);
        assert_eq!(service.avg_duration, 1266);
        assert_eq!(service.satisfied_count, 1);
        assert_eq!(service.tolerating_count, 1);
        assert_eq!(service.frustrated_count, 1);
        assert_eq!(service.error_calls, 1);
        assert!(service.last_call_error);

        let segments = store.table(&crate::registry::Role::new("segment_cost"));
        assert_eq!(segments.len(), 3);
    }
}
