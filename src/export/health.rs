use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::identity::pretty_user_key;
use crate::state::RunState;

const NAMESPACE: &str = "iotscope";

/// Prometheus metrics for client health, plus the local status server.
///
/// All metrics use the "iotscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Upload ===
    /// Reports accepted by the server.
    pub reports_submitted: Counter,
    /// Report attempts by outcome (success/rejected/malformed/error).
    pub report_attempts: CounterVec,
    /// Report cycles abandoned after exhausting retries.
    pub reports_abandoned: Counter,
    /// Report windows skipped for being too short.
    pub windows_skipped: Counter,
    /// Bytes observed by packet processing, as reported per cycle.
    pub bytes_observed: Counter,
    /// Throughput of the last upload cycle.
    pub throughput_bytes_per_second: Gauge,
    /// Whether inspection is enabled (1=yes, 0=no).
    pub inspecting: Gauge,

    // === Persistence ===
    /// Snapshots accepted into the queue.
    pub snapshots_enqueued: Counter,
    /// Snapshots dropped because the queue was full or closed.
    pub snapshots_dropped: Counter,
    /// Snapshots written to the store.
    pub snapshots_written: Counter,
    /// Snapshot failures by kind (decode/write).
    pub snapshot_errors: CounterVec,
    /// Rows written by table.
    pub rows_written: CounterVec,
    /// Malformed rows skipped by table.
    pub rows_rejected: CounterVec,
    /// Snapshot write duration.
    pub snapshot_write_duration: Histogram,
    /// Whether the store schema is ready (1=yes, 0=no).
    pub store_ready: Gauge,

    // === Secure computation ===
    /// Heartbeats by outcome (assigned/unassigned/failed).
    pub heartbeats: CounterVec,
    /// Orchestrator cycles by role and outcome.
    pub computations: CounterVec,
    /// External engine session duration.
    pub computation_duration: Histogram,

    // === Fingerprint ===
    /// Fingerprint submissions by outcome.
    pub fingerprints: CounterVec,

    // === Workers ===
    /// Cycles that returned an error, by worker.
    pub cycle_errors: CounterVec,
    /// Cycles that panicked, by worker.
    pub cycle_panics: CounterVec,

    // === Remote service ===
    /// Remote requests by endpoint and status.
    pub remote_requests_total: CounterVec,
    /// Remote request duration by endpoint.
    pub remote_request_duration: HistogramVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Upload ===
        let reports_submitted = Counter::with_opts(
            Opts::new(
                "reports_submitted_total",
                "Reports accepted by the coordination service.",
            )
            .namespace(NAMESPACE),
        )?;
        let report_attempts = CounterVec::new(
            Opts::new("report_attempts_total", "Report attempts by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let reports_abandoned = Counter::with_opts(
            Opts::new(
                "reports_abandoned_total",
                "Report cycles abandoned after exhausting retries.",
            )
            .namespace(NAMESPACE),
        )?;
        let windows_skipped = Counter::with_opts(
            Opts::new(
                "report_windows_skipped_total",
                "Report windows skipped for being too short.",
            )
            .namespace(NAMESPACE),
        )?;
        let bytes_observed = Counter::with_opts(
            Opts::new("bytes_observed_total", "Bytes observed on the network.")
                .namespace(NAMESPACE),
        )?;
        let throughput_bytes_per_second = Gauge::with_opts(
            Opts::new(
                "throughput_bytes_per_second",
                "Observed throughput over the last upload cycle.",
            )
            .namespace(NAMESPACE),
        )?;
        let inspecting = Gauge::with_opts(
            Opts::new(
                "inspecting",
                "Whether traffic inspection is enabled (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        // === Persistence ===
        let snapshots_enqueued = Counter::with_opts(
            Opts::new(
                "snapshots_enqueued_total",
                "Snapshots accepted into the persistence queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshots_dropped = Counter::with_opts(
            Opts::new(
                "snapshots_dropped_total",
                "Snapshots dropped because the persistence queue was full or closed.",
            )
            .namespace(NAMESPACE),
        )?;
        let snapshots_written = Counter::with_opts(
            Opts::new("snapshots_written_total", "Snapshots written to the store.")
                .namespace(NAMESPACE),
        )?;
        let snapshot_errors = CounterVec::new(
            Opts::new("snapshot_errors_total", "Snapshot failures by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_written = CounterVec::new(
            Opts::new("rows_written_total", "Rows written to the store by table.")
                .namespace(NAMESPACE),
            &["table"],
        )?;
        let rows_rejected = CounterVec::new(
            Opts::new("rows_rejected_total", "Malformed rows skipped by table.")
                .namespace(NAMESPACE),
            &["table"],
        )?;
        let snapshot_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "snapshot_write_duration_seconds",
                "Time to write one snapshot to the store.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;
        let store_ready = Gauge::with_opts(
            Opts::new(
                "store_ready",
                "Whether the persistence schema is ready (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        // === Secure computation ===
        let heartbeats = CounterVec::new(
            Opts::new("heartbeats_total", "Heartbeats by outcome.").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let computations = CounterVec::new(
            Opts::new(
                "computations_total",
                "Secure-computation cycles by role and outcome.",
            )
            .namespace(NAMESPACE),
            &["role", "outcome"],
        )?;
        let computation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "computation_duration_seconds",
                "Duration of external computation sessions.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;

        // === Fingerprint ===
        let fingerprints = CounterVec::new(
            Opts::new(
                "fingerprints_submitted_total",
                "Fingerprint submissions by outcome.",
            )
            .namespace(NAMESPACE),
            &["outcome"],
        )?;

        // === Workers ===
        let cycle_errors = CounterVec::new(
            Opts::new(
                "cycle_errors_total",
                "Worker cycles that returned an error.",
            )
            .namespace(NAMESPACE),
            &["worker"],
        )?;
        let cycle_panics = CounterVec::new(
            Opts::new("cycle_panics_total", "Worker cycles that panicked.").namespace(NAMESPACE),
            &["worker"],
        )?;

        // === Remote service ===
        let remote_requests_total = CounterVec::new(
            Opts::new(
                "remote_requests_total",
                "Coordination service requests by endpoint and status.",
            )
            .namespace(NAMESPACE),
            &["endpoint", "status"],
        )?;
        let remote_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "remote_request_duration_seconds",
                "Coordination service request duration by endpoint.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["endpoint"],
        )?;

        registry.register(Box::new(reports_submitted.clone()))?;
        registry.register(Box::new(report_attempts.clone()))?;
        registry.register(Box::new(reports_abandoned.clone()))?;
        registry.register(Box::new(windows_skipped.clone()))?;
        registry.register(Box::new(bytes_observed.clone()))?;
        registry.register(Box::new(throughput_bytes_per_second.clone()))?;
        registry.register(Box::new(inspecting.clone()))?;
        registry.register(Box::new(snapshots_enqueued.clone()))?;
        registry.register(Box::new(snapshots_dropped.clone()))?;
        registry.register(Box::new(snapshots_written.clone()))?;
        registry.register(Box::new(snapshot_errors.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(rows_rejected.clone()))?;
        registry.register(Box::new(snapshot_write_duration.clone()))?;
        registry.register(Box::new(store_ready.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(computations.clone()))?;
        registry.register(Box::new(computation_duration.clone()))?;
        registry.register(Box::new(fingerprints.clone()))?;
        registry.register(Box::new(cycle_errors.clone()))?;
        registry.register(Box::new(cycle_panics.clone()))?;
        registry.register(Box::new(remote_requests_total.clone()))?;
        registry.register(Box::new(remote_request_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            reports_submitted,
            report_attempts,
            reports_abandoned,
            windows_skipped,
            bytes_observed,
            throughput_bytes_per_second,
            inspecting,
            snapshots_enqueued,
            snapshots_dropped,
            snapshots_written,
            snapshot_errors,
            rows_written,
            rows_rejected,
            snapshot_write_duration,
            store_ready,
            heartbeats,
            computations,
            computation_duration,
            fingerprints,
            cycle_errors,
            cycle_panics,
            remote_requests_total,
            remote_request_duration,
        })
    }

    /// Starts the HTTP server serving /metrics, /healthz, /status and the
    /// inspection toggles. Returns the bound address.
    pub async fn start(&self, state: Arc<RunState>) -> Result<SocketAddr> {
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
            inspecting: self.inspecting.clone(),
            state,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/status", get(status_handler))
            .route("/inspection/pause", post(pause_handler))
            .route("/inspection/resume", post(resume_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "status server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "status server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the status server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }

    /// Records one coordination service request.
    pub fn record_remote_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.remote_requests_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.remote_request_duration
            .with_label_values(&[endpoint])
            .observe(seconds);
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    inspecting: Gauge,
    state: Arc<RunState>,
}

/// Client status as shown to the local UI.
#[derive(Debug, Serialize)]
struct StatusResponse {
    status: String,
    inspecting: bool,
    whitelisted_devices: usize,
    user_key: String,
    quit_requested: bool,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = app.registry.gather();

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

/// GET /status - Current client status.
async fn status_handler(State(app): State<Arc<AppState>>) -> Json<StatusResponse> {
    let state = &app.state;

    Json(StatusResponse {
        status: state.status().to_string(),
        inspecting: state.is_inspecting(),
        whitelisted_devices: state.device_whitelist().len(),
        user_key: pretty_user_key(state.user_key()),
        quit_requested: state.quit_requested(),
    })
}

/// POST /inspection/pause
async fn pause_handler(State(app): State<Arc<AppState>>) -> StatusCode {
    app.state.set_inspecting(false);
    app.inspecting.set(0.0);
    tracing::info!("inspection paused");
    StatusCode::NO_CONTENT
}

/// POST /inspection/resume
async fn resume_handler(State(app): State<Arc<AppState>>) -> StatusCode {
    app.state.set_inspecting(true);
    app.inspecting.set(1.0);
    tracing::info!("inspection resumed");
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;

    #[test]
    fn test_metrics_register_without_conflicts() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.record_remote_request("heartbeat", "success", 0.02);
        health.cycle_errors.with_label_values(&["upload"]).inc();

        let families = health.registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "iotscope_remote_requests_total"));
        assert!(families
            .iter()
            .any(|f| f.get_name() == "iotscope_cycle_errors_total"));
    }

    #[tokio::test]
    async fn test_status_and_pause_routes() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let state = test_state(false);
        let addr = health.start(Arc::clone(&state)).await.expect("start");

        let client = reqwest::Client::new();
        let base = format!("http://{addr}");

        let body = client
            .get(format!("{base}/healthz"))
            .send()
            .await
            .expect("healthz")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "ok");

        let resp = client
            .post(format!("{base}/inspection/pause"))
            .send()
            .await
            .expect("pause");
        assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
        assert!(!state.is_inspecting());

        let status: serde_json::Value = client
            .get(format!("{base}/status"))
            .send()
            .await
            .expect("status")
            .json()
            .await
            .expect("json");
        assert_eq!(status["inspecting"], false);
        assert_eq!(status["status"], "starting");
        assert_eq!(status["user_key"], "abcd-1234-efgh-5678");

        client
            .post(format!("{base}/inspection/resume"))
            .send()
            .await
            .expect("resume");
        assert!(state.is_inspecting());

        let metrics = client
            .get(format!("{base}/metrics"))
            .send()
            .await
            .expect("metrics")
            .text()
            .await
            .expect("body");
        assert!(metrics.contains("iotscope_inspecting 1"));

        health.stop().await.expect("stop");
    }
}
