use crate::resilience::CircuitState;
use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all musiclib metrics
const PREFIX: &str = "musiclib";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Task scheduler metrics
    pub static ref TASK_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_task_executions_total"), "Task executions by outcome"),
        &["task", "status"]
    ).expect("Failed to create task_executions_total metric");

    pub static ref TASK_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_task_duration_seconds"),
            "Task execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0]),
        &["task"]
    ).expect("Failed to create task_duration_seconds metric");

    pub static ref TASK_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_task_running"), "Whether a task is currently executing"),
        &["task"]
    ).expect("Failed to create task_running metric");

    // Resilience metrics
    pub static ref CIRCUIT_STATE: GaugeVec = GaugeVec::new(
        Opts::new(
            format!("{PREFIX}_circuit_state"),
            "Circuit breaker state per dependency (0=closed, 1=half_open, 2=open)"
        ),
        &["dependency"]
    ).expect("Failed to create circuit_state metric");

    // Library metrics
    pub static ref RECORDS_RECONCILED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_records_reconciled_total"), "Imported records by reconcile outcome"),
        &["source", "outcome"]
    ).expect("Failed to create records_reconciled_total metric");

    pub static ref DOWNLOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_downloads_total"), "Track downloads by outcome"),
        &["status"]
    ).expect("Failed to create downloads_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(TASK_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASK_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(CIRCUIT_STATE.clone()));
    let _ = REGISTRY.register(Box::new(RECORDS_RECONCILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADS_TOTAL.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record a finished task execution
pub fn record_task_execution(task: &str, status: &str, duration: Duration) {
    TASK_EXECUTIONS_TOTAL
        .with_label_values(&[task, status])
        .inc();

    TASK_DURATION_SECONDS
        .with_label_values(&[task])
        .observe(duration.as_secs_f64());
}

pub fn set_task_running(task: &str, running: bool) {
    TASK_RUNNING
        .with_label_values(&[task])
        .set(if running { 1.0 } else { 0.0 });
}

pub fn set_circuit_state(dependency: &str, state: CircuitState) {
    let value = match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    };
    CIRCUIT_STATE.with_label_values(&[dependency]).set(value);
}

pub fn record_reconciled(source: &str, outcome: &str) {
    RECORDS_RECONCILED_TOTAL
        .with_label_values(&[source, outcome])
        .inc();
}

pub fn record_download(status: &str) {
    DOWNLOADS_TOTAL.with_label_values(&[status]).inc();
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
