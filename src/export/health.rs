use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::bind_addr;

const NAMESPACE: &str = "flamestore";

/// Prometheus metrics for ingestion, storage and query health.
///
/// All metrics use the "flamestore" namespace. One instance is built at
/// startup and shared by every component.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingest ===
    /// Queue messages taken by the worker pool.
    pub artifacts_received: Counter,
    /// Artifacts fully written and acknowledged.
    pub artifacts_processed: Counter,
    /// Artifacts that failed, by reason.
    pub artifacts_failed: CounterVec,
    /// Sample lines skipped as malformed.
    pub partial_rows_skipped: Counter,
    /// Sample lines discarded as idle.
    pub idle_lines_skipped: Counter,
    /// Side-blob upload or metadata failures by kind.
    pub side_blob_errors: CounterVec,
    /// Workers currently processing an artifact.
    pub workers_busy: Gauge,

    // === Writer ===
    /// Rows waiting in each writer queue.
    pub writer_queue_length: GaugeVec,
    /// Writer queue capacity.
    pub writer_queue_capacity: GaugeVec,
    /// Flush duration by record kind.
    pub flush_duration: HistogramVec,
    /// Rows per flush by record kind.
    pub flush_batch_size: HistogramVec,
    /// Failed flush attempts by record kind.
    pub flush_errors: CounterVec,
    /// Rows written per tier.
    pub rows_written: CounterVec,

    // === Store ===
    /// Backend batch errors by backend and table.
    pub store_batch_errors: CounterVec,
    /// Rows removed by retention per tier.
    pub rows_evicted: CounterVec,

    // === Query ===
    /// Query duration by request kind.
    pub query_duration: HistogramVec,
    /// Parent frames lighter than one of their children.
    pub parent_weight_violations: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingest ===
        let artifacts_received = Counter::with_opts(
            Opts::new(
                "artifacts_received_total",
                "Total queue messages taken by the worker pool.",
            )
            .namespace(NAMESPACE),
        )?;
        let artifacts_processed = Counter::with_opts(
            Opts::new(
                "artifacts_processed_total",
                "Total artifacts written to every tier and acknowledged.",
            )
            .namespace(NAMESPACE),
        )?;
        let artifacts_failed = CounterVec::new(
            Opts::new(
                "artifacts_failed_total",
                "Total artifacts that failed processing by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let partial_rows_skipped = Counter::with_opts(
            Opts::new(
                "partial_rows_skipped_total",
                "Total malformed sample lines skipped during decoding.",
            )
            .namespace(NAMESPACE),
        )?;
        let idle_lines_skipped = Counter::with_opts(
            Opts::new(
                "idle_lines_skipped_total",
                "Total sample lines discarded as idle.",
            )
            .namespace(NAMESPACE),
        )?;
        let side_blob_errors = CounterVec::new(
            Opts::new(
                "side_blob_errors_total",
                "Total side-blob upload and metadata errors by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let workers_busy = Gauge::with_opts(
            Opts::new("workers_busy", "Workers currently processing an artifact.")
                .namespace(NAMESPACE),
        )?;

        // === Writer ===
        let writer_queue_length = GaugeVec::new(
            Opts::new("writer_queue_length", "Rows waiting in the writer queue.")
                .namespace(NAMESPACE),
            &["kind"],
        )?;
        let writer_queue_capacity = GaugeVec::new(
            Opts::new("writer_queue_capacity", "Writer queue capacity.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to flush a batch to every tier by record kind.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["kind"],
        )?;
        let flush_batch_size = HistogramVec::new(
            HistogramOpts::new("flush_batch_size", "Number of rows per flush by record kind.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 10.0, 100.0, 1000.0, 10000.0, 50000.0]),
            &["kind"],
        )?;
        let flush_errors = CounterVec::new(
            Opts::new(
                "flush_errors_total",
                "Total failed flush attempts by record kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Total rows written per tier.").namespace(NAMESPACE),
            &["tier"],
        )?;

        // === Store ===
        let store_batch_errors = CounterVec::new(
            Opts::new(
                "store_batch_errors_total",
                "Total store batch errors by backend and table.",
            )
            .namespace(NAMESPACE),
            &["backend", "table"],
        )?;
        let rows_evicted = CounterVec::new(
            Opts::new(
                "rows_evicted_total",
                "Total rows removed by retention per tier.",
            )
            .namespace(NAMESPACE),
            &["tier"],
        )?;

        // === Query ===
        let query_duration = HistogramVec::new(
            HistogramOpts::new("query_duration_seconds", "Query duration by request kind.")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["kind"],
        )?;
        let parent_weight_violations = Counter::with_opts(
            Opts::new(
                "parent_weight_violations_total",
                "Total frames whose weight is below one of their children.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(artifacts_received.clone()))?;
        registry.register(Box::new(artifacts_processed.clone()))?;
        registry.register(Box::new(artifacts_failed.clone()))?;
        registry.register(Box::new(partial_rows_skipped.clone()))?;
        registry.register(Box::new(idle_lines_skipped.clone()))?;
        registry.register(Box::new(side_blob_errors.clone()))?;
        registry.register(Box::new(workers_busy.clone()))?;
        registry.register(Box::new(writer_queue_length.clone()))?;
        registry.register(Box::new(writer_queue_capacity.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(flush_batch_size.clone()))?;
        registry.register(Box::new(flush_errors.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(store_batch_errors.clone()))?;
        registry.register(Box::new(rows_evicted.clone()))?;
        registry.register(Box::new(query_duration.clone()))?;
        registry.register(Box::new(parent_weight_violations.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            artifacts_received,
            artifacts_processed,
            artifacts_failed,
            partial_rows_skipped,
            idle_lines_skipped,
            side_blob_errors,
            workers_busy,
            writer_queue_length,
            writer_queue_capacity,
            flush_duration,
            flush_batch_size,
            flush_errors,
            rows_written,
            store_batch_errors,
            rows_evicted,
            query_duration,
            parent_weight_violations,
        })
    }

    /// Renders every registered metric in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind = bind_addr(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;

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

        Ok(local_addr)
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

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
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
