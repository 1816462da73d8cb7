//! Configuration schema types.
//!
//! This module defines the structure of all configuration sections.

use serde::{Deserialize, Serialize};
use switchyard_telemetry::{LogConfig, MetricsConfig};

/// Listener section.
///
/// Controls the multiplexing listener: port, drain ceiling, header limits and
/// HTTP/2 tuning.
///
/// # Example
///
/// ```
/// use switchyard_config::{Http2Section, ServerSettings};
///
/// let settings = ServerSettings {
///     port: 9000,
///     shutdown_delay_ms: 2000,
///     max_header_bytes: 1 << 20,
///     allow_private_network: false,
///     http2: Http2Section::default(),
/// };
/// assert_eq!(settings.port, 9000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSettings {
    /// TCP port to bind on all interfaces. 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on the connection drain during shutdown, in milliseconds.
    /// Rounded up to whole seconds at runtime.
    #[serde(default = "default_shutdown_delay_ms")]
    pub shutdown_delay_ms: u64,

    /// Maximum accepted request header size in bytes.
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,

    /// Emit `Access-Control-Allow-Private-Network: true` on gRPC-Web responses.
    #[serde(default)]
    pub allow_private_network: bool,

    /// HTTP/2 tuning.
    #[serde(default)]
    pub http2: Http2Section,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            shutdown_delay_ms: default_shutdown_delay_ms(),
            max_header_bytes: default_max_header_bytes(),
            allow_private_network: false,
            http2: Http2Section::default(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_delay_ms() -> u64 {
    10_000
}

fn default_max_header_bytes() -> usize {
    1 << 20
}

/// HTTP/2 tuning section.
///
/// Unset fields leave the connection builder's own defaults in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Http2Section {
    /// Maximum concurrent streams per connection.
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: Option<u32>,

    /// Initial per-stream flow-control window.
    #[serde(default)]
    pub initial_stream_window_size: Option<u32>,

    /// Initial connection-level flow-control window.
    #[serde(default)]
    pub initial_connection_window_size: Option<u32>,

    /// Maximum frame payload size.
    #[serde(default)]
    pub max_frame_size: Option<u32>,

    /// Interval between keep-alive pings, in seconds.
    #[serde(default)]
    pub keep_alive_interval_secs: Option<u64>,

    /// Time to wait for a keep-alive acknowledgement, in seconds.
    #[serde(default)]
    pub keep_alive_timeout_secs: Option<u64>,
}

impl Default for Http2Section {
    fn default() -> Self {
        Self {
            max_concurrent_streams: default_max_concurrent_streams(),
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            max_frame_size: None,
            keep_alive_interval_secs: None,
            keep_alive_timeout_secs: None,
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_max_concurrent_streams() -> Option<u32> {
    Some(250)
}

/// Log format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs (production).
    #[default]
    Json,
    /// Human-readable pretty format (development).
    Pretty,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSettings {
    /// Enable logging.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive (e.g. "info" or "switchyard_server=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include source file and line in logs.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            include_location: false,
        }
    }
}

impl LoggingSettings {
    /// Converts this section into the telemetry crate's [`LogConfig`].
    #[must_use]
    pub fn to_log_config(&self) -> LogConfig {
        let base = match self.format {
            LogFormat::Json => LogConfig::production(),
            LogFormat::Pretty => LogConfig::development(),
        };

        LogConfig {
            enabled: self.enabled,
            level: self.level.clone(),
            file_line_info: self.include_location,
            ..base
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsSettings {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Scrape endpoint address.
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

impl MetricsSettings {
    /// Converts this section into the telemetry crate's [`MetricsConfig`].
    #[must_use]
    pub fn to_metrics_config(&self) -> MetricsConfig {
        MetricsConfig {
            enabled: self.enabled,
            addr: self.addr.clone(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_true() -> bool {
    true
}
