//! Prometheus Metrics Module
//!
//! Exposes relay metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Events**: Bars enqueued, published and skipped by lagging readers
//! - **Fetches**: Upstream requests, transient failures and retries
//! - **Reconciliation**: Gaps and regressions seen by the live path
//! - **History**: Range queries by outcome and their latency
//! - **Tasks**: Running symbol tasks and their failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the HTTP server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Event counters
    describe_counter!(
        "kline_relay_events_enqueued_total",
        "Total bar events placed on the fan-in queue"
    );
    describe_counter!(
        "kline_relay_events_published_total",
        "Total bar events delivered to topic subscribers"
    );
    describe_counter!(
        "kline_relay_events_lagged_total",
        "Total events skipped by lagging stream readers"
    );

    // Fetch counters
    describe_counter!(
        "kline_relay_fetches_total",
        "Total raw window fetches sent upstream"
    );
    describe_counter!(
        "kline_relay_fetch_failures_total",
        "Total failed raw window fetches by error kind"
    );
    describe_counter!(
        "kline_relay_fetch_retries_total",
        "Total fetch retries scheduled by backoff"
    );

    // Reconciliation counters
    describe_counter!(
        "kline_relay_reconciler_anomalies_total",
        "Total gaps, regressions and malformed windows seen while polling"
    );

    // History
    describe_counter!(
        "kline_relay_history_requests_total",
        "Total history queries by outcome"
    );
    describe_histogram!(
        "kline_relay_history_duration_seconds",
        "Time to answer a history query"
    );

    // Tasks
    describe_gauge!(
        "kline_relay_symbol_tasks",
        "Number of running per-symbol reconciler tasks"
    );
    describe_counter!(
        "kline_relay_task_failures_total",
        "Total symbol tasks ended by a permanent error"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for reconciliation anomalies.
#[derive(Debug, Clone, Copy)]
pub enum AnomalyKind {
    /// Bars skipped between polls.
    Gap,
    /// Upstream went backwards.
    Regressed,
    /// Window with inverted bar order.
    Malformed,
}

impl AnomalyKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Gap => "gap",
            Self::Regressed => "regressed",
            Self::Malformed => "malformed",
        }
    }
}

/// Record a bar event enqueued for a symbol.
pub fn record_event_enqueued(symbol: &str) {
    counter!(
        "kline_relay_events_enqueued_total",
        "symbol" => symbol.to_string()
    )
    .increment(1);
}

/// Record events delivered to topic subscribers.
pub fn record_events_published(count: u64) {
    counter!("kline_relay_events_published_total").increment(count);
}

/// Record events skipped by a lagging stream reader.
pub fn record_events_lagged(count: u64) {
    counter!("kline_relay_events_lagged_total").increment(count);
}

/// Record a raw fetch sent to an adapter.
pub fn record_fetch(adapter: &str) {
    counter!(
        "kline_relay_fetches_total",
        "adapter" => adapter.to_string()
    )
    .increment(1);
}

/// Record a failed raw fetch.
pub fn record_fetch_failure(adapter: &str, kind: &'static str) {
    counter!(
        "kline_relay_fetch_failures_total",
        "adapter" => adapter.to_string(),
        "kind" => kind
    )
    .increment(1);
}

/// Record a retry scheduled after a transient failure.
pub fn record_fetch_retry(adapter: &str) {
    counter!(
        "kline_relay_fetch_retries_total",
        "adapter" => adapter.to_string()
    )
    .increment(1);
}

/// Record a reconciliation anomaly.
pub fn record_anomaly(symbol: &str, kind: AnomalyKind) {
    counter!(
        "kline_relay_reconciler_anomalies_total",
        "symbol" => symbol.to_string(),
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a finished history query.
pub fn record_history_request(outcome: &'static str, duration: Duration) {
    counter!(
        "kline_relay_history_requests_total",
        "outcome" => outcome
    )
    .increment(1);
    histogram!("kline_relay_history_duration_seconds").record(duration.as_secs_f64());
}

/// Update the running symbol task count.
pub fn set_symbol_tasks(count: f64) {
    gauge!("kline_relay_symbol_tasks").set(count);
}

/// Record a symbol task ended by a permanent error.
pub fn record_task_failure(symbol: &str, kind: &'static str) {
    counter!(
        "kline_relay_task_failures_total",
        "symbol" => symbol.to_string(),
        "kind" => kind
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
