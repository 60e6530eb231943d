//! Concrete roles handled by the collector.
//!
//! The three call metrics share their counters and differ only in the
//! identity columns. `segment_cost` is a write-once record: every segment
//! is stored once, so it needs no merging and can be spread round-robin.

use crate::metric_record;
use crate::registry::StaticSchemaSource;

metric_record! {
    /// Minute call metrics per application.
    pub struct ApplicationMetric : "application_metric" {
        non application_id: i32,
        add calls: i64,
        add error_calls: i64,
        add duration_sum: i64,
        add error_duration_sum: i64,
        add satisfied_count: i64,
        add tolerating_count: i64,
        add frustrated_count: i64,
        cover latest_call_time: i64,
        cover last_call_error: bool,
    }
    derived {
        avg_duration: i64 = duration_sum / calls,
    }
}

metric_record! {
    /// Minute call metrics per service endpoint.
    pub struct ServiceMetric : "service_metric" {
        non service_id: i32,
        non application_id: i32,
        add calls: i64,
        add error_calls: i64,
        add duration_sum: i64,
        add error_duration_sum: i64,
        add satisfied_count: i64,
        add tolerating_count: i64,
        add frustrated_count: i64,
        cover latest_call_time: i64,
        cover last_call_error: bool,
    }
    derived {
        avg_duration: i64 = duration_sum / calls,
    }
}

metric_record! {
    /// Minute call metrics per running instance.
    pub struct InstanceMetric : "instance_metric" {
        non instance_id: i32,
        non application_id: i32,
        add calls: i64,
        add error_calls: i64,
        add duration_sum: i64,
        add error_duration_sum: i64,
        add satisfied_count: i64,
        add tolerating_count: i64,
        add frustrated_count: i64,
        cover latest_call_time: i64,
        cover last_call_error: bool,
    }
    derived {
        avg_duration: i64 = duration_sum / calls,
    }
}

metric_record! {
    /// Cost of one trace segment, written once.
    pub struct SegmentCost : "segment_cost" {
        non segment_id: String,
        non application_id: i32,
        non service_name: String,
        non cost: i64,
        non is_error: bool,
        non start_time: i64,
    }
}

/// Names of every role, in registration order.
pub const ALL_ROLES: [&str; 4] = [
    "application_metric",
    "service_metric",
    "instance_metric",
    "segment_cost",
];

/// Schemas of every role the collector registers.
pub fn schema_source() -> StaticSchemaSource {
    StaticSchemaSource::new()
        .with::<ApplicationMetric>()
        .with::<ServiceMetric>()
        .with::<InstanceMetric>()
        .with::<SegmentCost>()
}
