//! Typed configuration for Switchyard.
//!
//! This crate provides a strongly-typed configuration system with support for:
//! - TOML and JSON configuration files
//! - Environment variable overrides
//! - Strict validation (fails on unknown fields)
//! - Layered configuration (defaults → file → env)
//!
//! The root type is [`SwitchyardConfig`]:
//!
//! - [`ServerSettings`] - listener port, drain ceiling, header limit, HTTP/2 tuning
//! - [`LoggingSettings`] - log level and format
//! - [`MetricsSettings`] - Prometheus exporter
//!
//! # Example
//!
//! ```no_run
//! use switchyard_config::{ConfigLoader, ConfigError};
//!
//! # fn main() -> Result<(), ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_defaults()
//!     .with_optional_file("switchyard.toml")?
//!     .with_env_prefix("SWITCHYARD")
//!     .load()?;
//!
//! println!("Listening on port {}", config.server.port);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 8080
//! shutdown_delay_ms = 10000
//! max_header_bytes = 1048576
//! allow_private_network = false
//!
//! [server.http2]
//! max_concurrent_streams = 250
//! max_frame_size = 16384
//! keep_alive_interval_secs = 30
//! keep_alive_timeout_secs = 20
//!
//! [logging]
//! enabled = true
//! level = "info"
//! format = "json"
//!
//! [metrics]
//! enabled = false
//! addr = "0.0.0.0:9090"
//! ```
//!
//! # Environment Variable Overrides
//!
//! Values can be overridden with `PREFIX__SECTION__KEY` variables:
//!
//! - `SWITCHYARD__SERVER__PORT=9000`
//! - `SWITCHYARD__SERVER__HTTP2__MAX_FRAME_SIZE=32768`
//! - `SWITCHYARD__LOGGING__FORMAT=pretty`

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::*;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SwitchyardConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.shutdown_delay_ms, 10_000);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_full_toml_document() {
        let toml = r#"
            [server]
            port = 0
            shutdown_delay_ms = 2000
            max_header_bytes = 65536
            allow_private_network = true

            [server.http2]
            max_concurrent_streams = 100
            initial_stream_window_size = 1048576
            initial_connection_window_size = 2097152
            max_frame_size = 16384
            keep_alive_interval_secs = 30
            keep_alive_timeout_secs = 20

            [logging]
            enabled = true
            level = "switchyard_server=debug,info"
            format = "json"

            [metrics]
            enabled = true
            addr = "127.0.0.1:9090"
        "#;

        let config = ConfigLoader::new()
            .with_string(toml, "toml")
            .unwrap()
            .load()
            .unwrap();

        assert_eq!(config.server.port, 0);
        assert_eq!(config.server.max_header_bytes, 65536);
        assert!(config.server.allow_private_network);
        assert_eq!(config.server.http2.max_concurrent_streams, Some(100));
        assert_eq!(config.server.http2.initial_connection_window_size, Some(2_097_152));
        assert!(config.metrics.enabled);
    }
}
