//! Synthetic agent traffic.
//!
//! Each simulated agent reports one call per interval for a small fixed set
//! of applications and services. Durations and error flags come from a hash
//! of the sequence number, so two runs produce the same traffic.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::listener::{Delivery, ServiceCall, ServiceCallListener};

const APPLICATIONS: [&str; 3] = ["shop", "billing", "search"];
const SERVICES: [&str; 4] = ["/checkout", "/cart", "/invoice", "/query"];

/// Totals reported when the generator stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub dispatched: u64,
    pub parked: u64,
}

/// Builds call `seq` of agent `agent`.
pub fn synthetic_call(agent: usize, seq: u64, now_ms: i64) -> ServiceCall {
    let noise = xxh3_64(&[(agent as u64).to_le_bytes(), seq.to_le_bytes()].concat());
    let application = APPLICATIONS[agent % APPLICATIONS.len()];
    let service = SERVICES[(noise % SERVICES.len() as u64) as usize];

    let jitter = ((noise >> 8) % 1_900) as i64;
    // Mostly fast, roughly one call in four slow.
    let duration_ms = if (noise >> 20) % 4 == 0 {
        600 + jitter
    } else {
        10 + jitter % 490
    };

    ServiceCall {
        application_code: application.to_string(),
        instance_key: format!("agent-{agent}"),
        service_name: service.to_string(),
        segment_id: format!("{agent}.{seq}"),
        start_time_ms: now_ms,
        duration_ms,
        is_error: (noise >> 32) % 20 == 0,
    }
}

/// Starts the generator thread. It stops when `cancel` fires or the
/// pipeline closes.
pub fn spawn(
    listener: Arc<ServiceCallListener>,
    agents: usize,
    interval: Duration,
    cancel: CancellationToken,
) -> io::Result<JoinHandle<SyntheticStats>> {
    thread::Builder::new()
        .name("synthetic-agents".to_string())
        .spawn(move || {
            info!(agents, interval = ?interval, "synthetic traffic started");
            let mut stats = SyntheticStats::default();
            let mut seq = 0u64;

            'outer: while !cancel.is_cancelled() {
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
                    .unwrap_or_default();

                for agent in 0..agents {
                    let call = synthetic_call(agent, seq, now_ms);
                    match listener.on_delta(&call) {
                        Ok(Delivery::Dispatched) => stats.dispatched += 1,
                        Ok(Delivery::Parked(_)) => stats.parked += 1,
                        Err(e) => {
                            warn!(error = %e, "synthetic dispatch rejected, stopping");
                            break 'outer;
                        }
                    }
                }
                seq += 1;

                if seq % 100 == 0 {
                    debug!(
                        dispatched = stats.dispatched,
                        parked = stats.parked,
                        "synthetic traffic progress",
                    );
                }
                thread::sleep(interval);
            }

            info!(
                dispatched = stats.dispatched,
                parked = stats.parked,
                "synthetic traffic stopped",
            );
            stats
        })
}
