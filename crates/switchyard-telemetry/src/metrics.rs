//! Prometheus metrics for Switchyard.
//!
//! Recording goes through the `metrics` facade, so the helpers below are
//! no-ops until [`init_metrics`] installs the Prometheus recorder.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `switchyard_requests_total` | Counter | `route` | Requests dispatched per route |
//! | `switchyard_request_panics_total` | Counter | - | Handler panics converted to 500 |
//! | `switchyard_in_flight_requests` | Gauge | - | Requests currently executing |
//! | `switchyard_open_connections` | Gauge | - | Connections present in the state tracker |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Requests dispatched, labelled by route.
pub const REQUESTS_TOTAL: &str = "switchyard_requests_total";
/// Handler panics recovered by the request wrapper.
pub const REQUEST_PANICS_TOTAL: &str = "switchyard_request_panics_total";
/// Requests currently executing.
pub const IN_FLIGHT_REQUESTS: &str = "switchyard_in_flight_requests";
/// Connections currently tracked as open.
pub const OPEN_CONNECTIONS: &str = "switchyard_open_connections";

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address the Prometheus scrape endpoint listens on (e.g. "0.0.0.0:9090").
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Installs the Prometheus recorder and its HTTP scrape listener.
///
/// The listener runs on the current Tokio runtime when there is one, and on a
/// background thread otherwise.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidAddress` if `addr` does not parse, or
/// `TelemetryError::MetricsInit` if a recorder cannot be installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .map_err(|e| TelemetryError::InvalidAddress(format!("{}: {e}", config.addr)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    register_metric_descriptions();

    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!(REQUESTS_TOTAL, "Requests dispatched by the protocol router");
    describe_counter!(
        REQUEST_PANICS_TOTAL,
        "Backend panics recovered and answered with 500"
    );
    describe_gauge!(IN_FLIGHT_REQUESTS, "Requests currently executing");
    describe_gauge!(OPEN_CONNECTIONS, "Connections tracked as open");
}

/// Records one dispatched request on `route`.
pub fn record_request(route: &'static str) {
    counter!(REQUESTS_TOTAL, "route" => route).increment(1);
}

/// Records one recovered handler panic.
pub fn record_panic() {
    counter!(REQUEST_PANICS_TOTAL).increment(1);
}

/// Increments the in-flight requests gauge.
pub fn increment_in_flight() {
    gauge!(IN_FLIGHT_REQUESTS).increment(1.0);
}

/// Decrements the in-flight requests gauge.
pub fn decrement_in_flight() {
    gauge!(IN_FLIGHT_REQUESTS).decrement(1.0);
}

/// Sets the open connections gauge.
pub fn set_open_connections(count: usize) {
    gauge!(OPEN_CONNECTIONS).set(count as f64);
}
