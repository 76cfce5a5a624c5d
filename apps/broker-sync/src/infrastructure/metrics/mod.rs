//! Prometheus Metrics Module
//!
//! Registers the counters and gauges recorded across the crate:
//!
//! - message volume in and out of the gateways
//! - connection state and reconnect attempts
//! - rate limiter backpressure waits
//! - cache persistence cycles

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(
        "broker_sync_messages_received_total",
        "Total data messages received from gateways"
    );
    describe_counter!(
        "broker_sync_messages_sent_total",
        "Total messages sent to gateways"
    );
    describe_counter!(
        "broker_sync_connection_errors_total",
        "Total connection attempt failures"
    );
    describe_counter!(
        "broker_sync_reconnects_total",
        "Total gateway reconnection attempts"
    );
    describe_counter!(
        "broker_sync_rate_limit_waits_total",
        "Total sends delayed by a rate limiter"
    );
    describe_counter!(
        "broker_sync_cache_persists_total",
        "Total cache snapshots persisted to storage"
    );
    describe_gauge!(
        "broker_sync_active_connections",
        "Number of registered gateway connections"
    );
}
