//! Runtime server configuration.
//!
//! [`ServerConfig`] is immutable once built. It can be assembled with the
//! builder or derived from the file/env schema in `switchyard-config`.
//!
//! # Example
//!
//! ```rust
//! use switchyard_server::ServerConfig;
//! use std::time::Duration;
//!
//! let config = ServerConfig::builder()
//!     .port(9000)
//!     .shutdown_delay(Duration::from_millis(1500))
//!     .build();
//!
//! assert_eq!(config.port(), 9000);
//! assert_eq!(config.drain_seconds(), 2);
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use switchyard_config::{
    ServerSettings, MAX_HTTP2_FRAME_SIZE, MAX_HTTP2_WINDOW_SIZE, MIN_HTTP2_FRAME_SIZE,
};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default upper bound on connection draining.
pub const DEFAULT_SHUTDOWN_DELAY: Duration = Duration::from_secs(10);

/// Default maximum request header size (1 MiB).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Default HTTP/2 concurrent stream limit.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 250;

/// Callback invoked with the bound address once the server accepts connections.
pub type OnStarted = Arc<dyn Fn(SocketAddr) + Send + Sync>;

/// HTTP/2 tuning. `None` keeps the connection builder's default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Settings {
    /// Maximum concurrent streams per connection.
    pub max_concurrent_streams: Option<u32>,
    /// Initial per-stream flow-control window.
    pub initial_stream_window_size: Option<u32>,
    /// Initial connection-level flow-control window.
    pub initial_connection_window_size: Option<u32>,
    /// Maximum frame payload size.
    pub max_frame_size: Option<u32>,
    /// Interval between keep-alive pings.
    pub keep_alive_interval: Option<Duration>,
    /// Time to wait for a keep-alive acknowledgement.
    pub keep_alive_timeout: Option<Duration>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: Some(DEFAULT_MAX_CONCURRENT_STREAMS),
            initial_stream_window_size: None,
            initial_connection_window_size: None,
            max_frame_size: None,
            keep_alive_interval: None,
            keep_alive_timeout: None,
        }
    }
}

impl Http2Settings {
    /// Brings every value into the range HTTP/2 allows.
    ///
    /// Frame sizes are clamped to 16 KiB..=16 MiB - 1 and windows to
    /// 2^31 - 1, so the connection builder never sees a value it rejects.
    #[must_use]
    pub fn clamped(self) -> Self {
        let clamp_window = |size: Option<u32>| size.map(|s| s.min(MAX_HTTP2_WINDOW_SIZE));
        Self {
            initial_stream_window_size: clamp_window(self.initial_stream_window_size),
            initial_connection_window_size: clamp_window(self.initial_connection_window_size),
            max_frame_size: self
                .max_frame_size
                .map(|s| s.clamp(MIN_HTTP2_FRAME_SIZE, MAX_HTTP2_FRAME_SIZE)),
            ..self
        }
    }
}

/// Server configuration.
///
/// Use [`ServerConfig::builder()`] to construct instances.
#[derive(Clone)]
pub struct ServerConfig {
    port: u16,
    shutdown_delay: Duration,
    max_header_bytes: usize,
    http2: Http2Settings,
    on_started: Option<OnStarted>,
    allow_private_network: bool,
}

impl ServerConfig {
    /// Creates a new server configuration builder.
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Builds a configuration from the `[server]` section of the config file.
    ///
    /// # Example
    ///
    /// ```rust
    /// use switchyard_config::ServerSettings;
    /// use switchyard_server::ServerConfig;
    ///
    /// let settings = ServerSettings { port: 0, ..Default::default() };
    /// let config = ServerConfig::from_settings(&settings);
    /// assert_eq!(config.port(), 0);
    /// ```
    #[must_use]
    pub fn from_settings(settings: &ServerSettings) -> Self {
        let h2 = &settings.http2;
        Self::builder()
            .port(settings.port)
            .shutdown_delay(Duration::from_millis(settings.shutdown_delay_ms))
            .max_header_bytes(settings.max_header_bytes)
            .allow_private_network(settings.allow_private_network)
            .http2(Http2Settings {
                max_concurrent_streams: h2.max_concurrent_streams,
                initial_stream_window_size: h2.initial_stream_window_size,
                initial_connection_window_size: h2.initial_connection_window_size,
                max_frame_size: h2.max_frame_size,
                keep_alive_interval: h2.keep_alive_interval_secs.map(Duration::from_secs),
                keep_alive_timeout: h2.keep_alive_timeout_secs.map(Duration::from_secs),
            })
            .build()
    }

    /// Port to bind on all interfaces; 0 picks an ephemeral port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Upper bound on connection draining during shutdown.
    #[must_use]
    pub fn shutdown_delay(&self) -> Duration {
        self.shutdown_delay
    }

    /// The drain ceiling in whole seconds, rounded up.
    #[must_use]
    pub fn drain_seconds(&self) -> u64 {
        self.shutdown_delay.as_secs() + u64::from(self.shutdown_delay.subsec_nanos() > 0)
    }

    /// Maximum accepted request header size in bytes.
    #[must_use]
    pub fn max_header_bytes(&self) -> usize {
        self.max_header_bytes
    }

    /// HTTP/2 tuning.
    #[must_use]
    pub fn http2(&self) -> &Http2Settings {
        &self.http2
    }

    /// Start-completion callback, if any.
    #[must_use]
    pub fn on_started(&self) -> Option<&OnStarted> {
        self.on_started.as_ref()
    }

    /// Whether gRPC-Web responses allow private-network CORS access.
    #[must_use]
    pub fn allow_private_network(&self) -> bool {
        self.allow_private_network
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("shutdown_delay", &self.shutdown_delay)
            .field("max_header_bytes", &self.max_header_bytes)
            .field("http2", &self.http2)
            .field("on_started", &self.on_started.is_some())
            .field("allow_private_network", &self.allow_private_network)
            .finish()
    }
}

/// Builder for [`ServerConfig`].
#[derive(Clone)]
pub struct ServerConfigBuilder {
    port: u16,
    shutdown_delay: Duration,
    max_header_bytes: usize,
    http2: Http2Settings,
    on_started: Option<OnStarted>,
    allow_private_network: bool,
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            shutdown_delay: DEFAULT_SHUTDOWN_DELAY,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            http2: Http2Settings::default(),
            on_started: None,
            allow_private_network: false,
        }
    }
}

impl ServerConfigBuilder {
    /// Sets the listen port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the drain ceiling. Rounded up to whole seconds at shutdown.
    #[must_use]
    pub fn shutdown_delay(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// Sets the maximum accepted request header size.
    #[must_use]
    pub fn max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }

    /// Replaces the HTTP/2 tuning. Out-of-range values are clamped by
    /// [`build`](Self::build).
    #[must_use]
    pub fn http2(mut self, settings: Http2Settings) -> Self {
        self.http2 = settings;
        self
    }

    /// Sets a callback that receives the bound address after startup.
    #[must_use]
    pub fn on_started<F>(mut self, callback: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.on_started = Some(Arc::new(callback));
        self
    }

    /// Adds `Access-Control-Allow-Private-Network: true` to gRPC-Web responses.
    #[must_use]
    pub fn allow_private_network(mut self, allow: bool) -> Self {
        self.allow_private_network = allow;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            shutdown_delay: self.shutdown_delay,
            max_header_bytes: self.max_header_bytes,
            http2: self.http2.clamped(),
            on_started: self.on_started,
            allow_private_network: self.allow_private_network,
        }
    }
}

impl fmt::Debug for ServerConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfigBuilder")
            .field("port", &self.port)
            .field("shutdown_delay", &self.shutdown_delay)
            .finish_non_exhaustive()
    }
}
