use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "streamfold";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "streamfold" namespace. Grouped by stage:
/// - Dispatch: producer-side routing and backpressure
/// - Persistence: shard buffers and flushes
/// - Identity: cache-aside lookups
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Dispatch ===
    /// Deltas published to a shard queue, by role.
    pub deltas_dispatched: CounterVec,
    /// Publishes that waited on a full queue, by role.
    pub dispatch_blocked: CounterVec,
    /// Deltas held back before dispatch, by reason.
    pub deltas_parked: CounterVec,

    // === Persistence ===
    /// Number of shard consumer threads running.
    pub shards_running: Gauge,
    /// Rows written to storage, by role.
    pub rows_written: CounterVec,
    /// Failed flush steps by role and stage (read/write).
    pub flush_errors: CounterVec,
    /// Flush duration by role (1ms-5s buckets).
    pub flush_duration: HistogramVec,
    /// Rows held in a shard buffer awaiting flush.
    pub buffered_rows: GaugeVec,
    /// Write-once columns that received a conflicting value, by role.
    pub non_column_conflicts: CounterVec,

    // === Identity ===
    /// Identity cache requests by cache and result (hit/miss/failure).
    pub identity_cache_requests: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Dispatch ===
        let deltas_dispatched = CounterVec::new(
            Opts::new(
                "deltas_dispatched_total",
                "Total deltas published to a shard queue by role.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let dispatch_blocked = CounterVec::new(
            Opts::new(
                "dispatch_blocked_total",
                "Total publishes that waited on a full shard queue by role.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;
        let deltas_parked = CounterVec::new(
            Opts::new(
                "deltas_parked_total",
                "Total deltas held back before dispatch by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;

        // === Persistence ===
        let shards_running = Gauge::with_opts(
            Opts::new("shards_running", "Number of shard consumer threads running.")
                .namespace(NAMESPACE),
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Total rows written to storage by role.")
                .namespace(NAMESPACE),
            &["role"],
        )?;
        let flush_errors = CounterVec::new(
            Opts::new(
                "flush_errors_total",
                "Total failed flush steps by role and stage.",
            )
            .namespace(NAMESPACE),
            &["role", "stage"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to flush a shard buffer to storage by role.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["role"],
        )?;
        let buffered_rows = GaugeVec::new(
            Opts::new(
                "buffered_rows",
                "Rows held in a shard buffer awaiting flush.",
            )
            .namespace(NAMESPACE),
            &["role", "shard"],
        )?;
        let non_column_conflicts = CounterVec::new(
            Opts::new(
                "non_column_conflicts_total",
                "Total write-once columns that received a conflicting value by role.",
            )
            .namespace(NAMESPACE),
            &["role"],
        )?;

        // === Identity ===
        let identity_cache_requests = CounterVec::new(
            Opts::new(
                "identity_cache_requests_total",
                "Total identity cache requests by cache and result.",
            )
            .namespace(NAMESPACE),
            &["cache", "result"],
        )?;

        registry.register(Box::new(deltas_dispatched.clone()))?;
        registry.register(Box::new(dispatch_blocked.clone()))?;
        registry.register(Box::new(deltas_parked.clone()))?;
        registry.register(Box::new(shards_running.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(buffered_rows.clone()))?;
        registry.register(Box::new(non_column_conflicts.clone()))?;
        registry.register(Box::new(identity_cache_requests.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            deltas_dispatched,
            dispatch_blocked,
            deltas_parked,
            shards_running,
            rows_written,
            flush_errors,
            flush_duration,
            buffered_rows,
            non_column_conflicts,
            identity_cache_requests,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn render(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
