//! Logging and metrics for Switchyard.
//!
//! This crate owns the process-wide observability setup for a Switchyard
//! server:
//!
//! - **Logging**: structured output through `tracing-subscriber`, JSON for
//!   production and a pretty format for development
//! - **Metrics**: a Prometheus recorder behind the `metrics` facade, plus the
//!   recording helpers the server calls on its hot path
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `switchyard_requests_total` | Counter | `route` | Requests by dispatch outcome |
//! | `switchyard_request_panics_total` | Counter | - | Backend panics converted to 500 |
//! | `switchyard_in_flight_requests` | Gauge | - | Requests currently dispatched |
//! | `switchyard_open_connections` | Gauge | - | Connections present in the state tracker |
//!
//! # Example
//!
//! ```rust,ignore
//! use switchyard_telemetry::{init_logging, init_metrics, LogConfig, MetricsConfig};
//!
//! init_logging(&LogConfig::production())?;
//! init_metrics(&MetricsConfig::default())?;
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};
pub use metrics::{init_metrics, MetricsConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
