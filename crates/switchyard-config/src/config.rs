//! Main configuration types.
//!
//! This module provides the top-level [`SwitchyardConfig`] struct and its builder.

use serde::{Deserialize, Serialize};

use crate::{ConfigError, LogFormat, LoggingSettings, MetricsSettings, ServerSettings};

/// Smallest HTTP/2 `SETTINGS_MAX_FRAME_SIZE` a peer may advertise.
pub const MIN_HTTP2_FRAME_SIZE: u32 = 16_384;

/// Largest HTTP/2 `SETTINGS_MAX_FRAME_SIZE` a peer may advertise.
pub const MAX_HTTP2_FRAME_SIZE: u32 = 16_777_215;

/// Largest HTTP/2 flow-control window.
pub const MAX_HTTP2_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Complete Switchyard configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load configuration from files
/// and environment variables.
///
/// # Example
///
/// ```
/// use switchyard_config::SwitchyardConfig;
///
/// let config = SwitchyardConfig::default();
/// assert_eq!(config.server.port, 8080);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct SwitchyardConfig {
    /// Listener configuration.
    #[serde(default)]
    pub server: ServerSettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl SwitchyardConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> SwitchyardConfigBuilder {
        SwitchyardConfigBuilder::new()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for the first field that is out of
    /// range, or `ConfigError::ValidationError` for inconsistent combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_header_bytes == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_header_bytes",
                "must be greater than zero",
            ));
        }

        let http2 = &self.server.http2;

        if let Some(size) = http2.max_frame_size {
            if !(MIN_HTTP2_FRAME_SIZE..=MAX_HTTP2_FRAME_SIZE).contains(&size) {
                return Err(ConfigError::invalid_value(
                    "server.http2.max_frame_size",
                    format!("must be between {MIN_HTTP2_FRAME_SIZE} and {MAX_HTTP2_FRAME_SIZE}"),
                ));
            }
        }

        for (field, window) in [
            (
                "server.http2.initial_stream_window_size",
                http2.initial_stream_window_size,
            ),
            (
                "server.http2.initial_connection_window_size",
                http2.initial_connection_window_size,
            ),
        ] {
            if window.is_some_and(|w| w > MAX_HTTP2_WINDOW_SIZE) {
                return Err(ConfigError::invalid_value(
                    field,
                    format!("must not exceed {MAX_HTTP2_WINDOW_SIZE}"),
                ));
            }
        }

        if http2.keep_alive_timeout_secs.is_some() && http2.keep_alive_interval_secs.is_none() {
            return Err(ConfigError::validation_error(
                "server.http2.keep_alive_timeout_secs requires keep_alive_interval_secs",
            ));
        }

        if self.metrics.enabled && self.metrics.addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "metrics.addr",
                format!("invalid socket address: {}", self.metrics.addr),
            ));
        }

        if let Err(e) = switchyard_telemetry::logging::create_env_filter(&self.logging.level) {
            return Err(ConfigError::invalid_value("logging.level", e.to_string()));
        }

        Ok(())
    }

    /// Development preset: pretty debug logs with source locations and a
    /// short drain so restarts are quick.
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();

        config.logging.level = "debug".to_string();
        config.logging.format = LogFormat::Pretty;
        config.logging.include_location = true;

        config.server.shutdown_delay_ms = 1000;

        config
    }

    /// Production preset: JSON logs at info level and metrics enabled.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();

        config.logging.level = "info".to_string();
        config.logging.format = LogFormat::Json;

        config.metrics.enabled = true;

        config
    }
}

/// Builder for [`SwitchyardConfig`].
#[derive(Debug, Default)]
pub struct SwitchyardConfigBuilder {
    server: Option<ServerSettings>,
    logging: Option<LoggingSettings>,
    metrics: Option<MetricsSettings>,
}

impl SwitchyardConfigBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listener configuration.
    #[must_use]
    pub fn server(mut self, server: ServerSettings) -> Self {
        self.server = Some(server);
        self
    }

    /// Set the logging configuration.
    #[must_use]
    pub fn logging(mut self, logging: LoggingSettings) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Set the metrics configuration.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsSettings) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the configuration. Unset sections use their defaults.
    #[must_use]
    pub fn build(self) -> SwitchyardConfig {
        SwitchyardConfig {
            server: self.server.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
        }
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if validation fails.
    pub fn build_validated(self) -> Result<SwitchyardConfig, ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Http2Section;

    #[test]
    fn test_default_config_is_valid() {
        let config = SwitchyardConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_builder_server() {
        let config = SwitchyardConfig::builder()
            .server(ServerSettings {
                port: 0,
                ..Default::default()
            })
            .build();

        assert_eq!(config.server.port, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_header_bytes_rejected() {
        let mut config = SwitchyardConfig::default();
        config.server.max_header_bytes = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.max_header_bytes"));
    }

    #[test]
    fn test_frame_size_bounds() {
        let mut config = SwitchyardConfig::default();

        config.server.http2.max_frame_size = Some(MIN_HTTP2_FRAME_SIZE - 1);
        assert!(config.validate().is_err());

        config.server.http2.max_frame_size = Some(MAX_HTTP2_FRAME_SIZE + 1);
        assert!(config.validate().is_err());

        config.server.http2.max_frame_size = Some(MIN_HTTP2_FRAME_SIZE);
        assert!(config.validate().is_ok());

        config.server.http2.max_frame_size = Some(MAX_HTTP2_FRAME_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_size_bound() {
        let config = SwitchyardConfig::builder()
            .server(ServerSettings {
                http2: Http2Section {
                    initial_connection_window_size: Some(u32::MAX),
                    ..Default::default()
                },
                ..Default::default()
            })
            .build();

        let err = config.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("server.http2.initial_connection_window_size"));
    }

    #[test]
    fn test_keep_alive_timeout_requires_interval() {
        let mut config = SwitchyardConfig::default();
        config.server.http2.keep_alive_timeout_secs = Some(20);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        config.server.http2.keep_alive_interval_secs = Some(30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_metrics_addr_only_when_enabled() {
        let mut config = SwitchyardConfig::default();
        config.metrics.addr = "not-an-address".to_string();
        assert!(config.validate().is_ok());

        config.metrics.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("metrics.addr"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SwitchyardConfig::default();
        config.logging.level = "switchyard=notalevel".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn test_presets() {
        let dev = SwitchyardConfig::development();
        assert_eq!(dev.logging.format, LogFormat::Pretty);
        assert_eq!(dev.logging.level, "debug");
        assert!(dev.validate().is_ok());

        let prod = SwitchyardConfig::production();
        assert_eq!(prod.logging.format, LogFormat::Json);
        assert!(prod.metrics.enabled);
        assert!(prod.validate().is_ok());
    }

    #[test]
    fn test_build_validated() {
        let result = SwitchyardConfig::builder()
            .logging(LoggingSettings {
                level: "switchyard=notalevel".to_string(),
                ..Default::default()
            })
            .build_validated();

        assert!(result.is_err());
    }
}
