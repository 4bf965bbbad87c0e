use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchKey, DispatchOutcome};

const NAMESPACE: &str = "rollupd";

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "rollupd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    // === Dispatcher ===
    /// Total signals accepted by the dispatcher.
    pub signals_submitted: Counter,
    /// Drained executions by status (completed/failed/panicked).
    pub dispatch_executions: CounterVec,
    /// Time spent inside drained work.
    pub dispatch_execution_duration: Histogram,
    /// Keys currently holding pending work.
    pub dispatch_pending_keys: Gauge,

    // === Rollup ===
    /// Snapshots persisted.
    pub rollup_snapshots_written: Counter,
    /// Runs that found nothing new since the last snapshot.
    pub rollup_runs_skipped: Counter,
    /// Rollup failures by stage (eligibility/build/persist).
    pub rollup_errors: CounterVec,

    // === Ingestion ===
    /// Events produced by the synthetic generator.
    pub synthetic_events: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let signals_submitted = Counter::with_opts(
            Opts::new(
                "signals_submitted_total",
                "Total signals accepted by the dispatcher.",
            )
            .namespace(NAMESPACE),
        )?;
        let dispatch_executions = CounterVec::new(
            Opts::new(
                "dispatch_executions_total",
                "Drained executions by status.",
            )
            .namespace(NAMESPACE),
            &["status"],
        )?;
        let dispatch_execution_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_execution_duration_seconds",
                "Time spent inside drained work.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
        )?;
        let dispatch_pending_keys = Gauge::with_opts(
            Opts::new("dispatch_pending_keys", "Keys currently holding pending work.")
                .namespace(NAMESPACE),
        )?;

        let rollup_snapshots_written = Counter::with_opts(
            Opts::new("rollup_snapshots_written_total", "Snapshots persisted.")
                .namespace(NAMESPACE),
        )?;
        let rollup_runs_skipped = Counter::with_opts(
            Opts::new(
                "rollup_runs_skipped_total",
                "Runs that found nothing new since the last snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let rollup_errors = CounterVec::new(
            Opts::new("rollup_errors_total", "Rollup failures by stage.").namespace(NAMESPACE),
            &["stage"],
        )?;

        let synthetic_events = Counter::with_opts(
            Opts::new(
                "synthetic_events_total",
                "Events produced by the synthetic generator.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(signals_submitted.clone()))?;
        registry.register(Box::new(dispatch_executions.clone()))?;
        registry.register(Box::new(dispatch_execution_duration.clone()))?;
        registry.register(Box::new(dispatch_pending_keys.clone()))?;
        registry.register(Box::new(rollup_snapshots_written.clone()))?;
        registry.register(Box::new(rollup_runs_skipped.clone()))?;
        registry.register(Box::new(rollup_errors.clone()))?;
        registry.register(Box::new(synthetic_events.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            signals_submitted,
            dispatch_executions,
            dispatch_execution_duration,
            dispatch_pending_keys,
            rollup_snapshots_written,
            rollup_runs_skipped,
            rollup_errors,
            synthetic_events,
        })
    }

    /// Records one drained execution.
    pub fn observe_outcome<K: DispatchKey>(&self, outcome: &DispatchOutcome<K>) {
        self.dispatch_executions
            .with_label_values(&[outcome.status.as_str()])
            .inc();
        self.dispatch_execution_duration
            .observe(outcome.elapsed.as_secs_f64());
    }

    /// Metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }

    /// Address the server bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
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

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

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

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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
