//! Prometheus Metrics Module
//!
//! Exposes hub metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: Published, delivered and rejected tick counts
//! - **Subscriptions**: Active channel count
//! - **Errors**: Store errors, publish failures, callback panics
//! - **Latency**: Publish path duration (store, cache, transport)
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

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
/// Calling this again returns the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
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
    // Tick counters
    describe_counter!(
        "market_data_ticks_published_total",
        "Total ticks recorded and published"
    );
    describe_counter!(
        "market_data_ticks_delivered_total",
        "Total callback invocations for received ticks"
    );
    describe_counter!(
        "market_data_malformed_payloads_total",
        "Total transport messages dropped as unreadable"
    );
    describe_counter!(
        "market_data_stream_overflow_total",
        "Total ticks dropped because a tick stream was full"
    );

    // Subscription gauges
    describe_gauge!(
        "market_data_active_channels",
        "Number of channels with at least one callback"
    );

    // Error counters
    describe_counter!(
        "market_data_callback_failures_total",
        "Total callbacks that panicked during delivery"
    );
    describe_counter!(
        "market_data_store_errors_total",
        "Total data access errors on the publish path"
    );
    describe_counter!(
        "market_data_publish_failures_total",
        "Total ticks recorded but not broadcast"
    );

    // Latency histograms
    describe_histogram!(
        "market_data_publish_seconds",
        "Time from publish request to transport acknowledgement"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a tick that went through the full publish path.
pub fn record_tick_published() {
    counter!("market_data_ticks_published_total").increment(1);
}

/// Record callback invocations for one received tick.
pub fn record_ticks_delivered(count: u64) {
    counter!("market_data_ticks_delivered_total").increment(count);
}

/// Record a dropped transport message.
pub fn record_malformed_payload(reason: &'static str) {
    counter!("market_data_malformed_payloads_total", "reason" => reason).increment(1);
}

/// Record a tick dropped by a full tick stream.
pub fn record_stream_overflow() {
    counter!("market_data_stream_overflow_total").increment(1);
}

/// Update the active channel count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_channels(count: usize) {
    gauge!("market_data_active_channels").set(count as f64);
}

/// Record a panicking callback.
pub fn record_callback_failure() {
    counter!("market_data_callback_failures_total").increment(1);
}

/// Record a data access error on the publish path.
pub fn record_store_error(kind: &'static str) {
    counter!("market_data_store_errors_total", "kind" => kind).increment(1);
}

/// Record a tick that was recorded but not broadcast.
pub fn record_publish_failure() {
    counter!("market_data_publish_failures_total").increment(1);
}

/// Record publish path duration.
pub fn record_publish_duration(duration: Duration) {
    histogram!("market_data_publish_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
