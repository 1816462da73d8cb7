//! Server orchestrator.
//!
//! Owns the listener, the connection builder around the
//! [`ProtocolRouter`], the connection tracker, and the shutdown sequence.
//!
//! # Shutdown
//!
//! When the signal passed to [`Server::start_and_wait`] fires:
//!
//! 1. Plain HTTP/1.x responses start carrying `Connection: close`.
//! 2. Open connections are polled every 100 ms for at most the shutdown
//!    delay, rounded up to whole seconds. A second in which no connection
//!    was seen ends the wait early.
//! 3. The gRPC backend is stopped gracefully, the accept loop stops, and
//!    every connection is asked to shut down. The server then waits for
//!    executing requests to finish.
//!
//! # Example
//!
//! ```rust,no_run
//! use switchyard_server::{full_body, HttpRequest, HttpResponse, Server, ServerConfig, ShutdownSignal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::builder()
//!         .config(ServerConfig::builder().port(8080).build())
//!         .http_handler(|_req: HttpRequest| async { HttpResponse::new(full_body("OK")) })
//!         .build();
//!
//!     server.start_and_wait(ShutdownSignal::with_os_signals()).await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use http::{Request, Response, StatusCode, Version};
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::backend::{GrpcBackend, GrpcWebBackend, HttpHandler};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::h2c::{self, UpgradedStream};
use crate::router::{bad_request, internal_server_error, ProtocolRouter};
use crate::shutdown::{InFlight, InFlightGuard, ShutdownSignal};
use crate::tracker::{ConnState, ConnStateTracker, ConnectionId};
use crate::{BoxError, BoxFuture, HttpResponse, ResponseBody};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DRAIN_POLLS_PER_SECOND: u32 = 10;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Smallest read buffer hyper's HTTP/1 connection accepts.
const MIN_HTTP1_BUF_SIZE: usize = 8192;

/// A gRPC, gRPC-Web, and HTTP server sharing one listener.
///
/// Use [`Server::builder()`] to construct instances.
pub struct Server {
    config: ServerConfig,
    router: Arc<ProtocolRouter>,
    tracker: Arc<ConnStateTracker>,
    in_flight: InFlight,
}

impl Server {
    /// Creates a new server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Returns a reference to the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the protocol router.
    #[must_use]
    pub fn router(&self) -> &ProtocolRouter {
        &self.router
    }

    /// Owned snapshot of every open connection and its state.
    #[must_use]
    pub fn conn_states(&self) -> HashMap<ConnectionId, ConnState> {
        self.tracker.snapshot()
    }

    /// Services registered with the gRPC backend; empty without one.
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.router
            .grpc()
            .map(|grpc| grpc.service_names())
            .unwrap_or_default()
    }

    /// Counter of requests currently executing.
    #[must_use]
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Binds, serves until `shutdown` fires, then drains and stops.
    ///
    /// The listener binds `0.0.0.0:<port>`. Once the accept loop is running
    /// the configured `on_started` callback receives the bound address.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Bind`] if the listener cannot be bound.
    /// - [`ServerError::Serve`] if accepting fails before shutdown.
    /// - [`ServerError::ServeTask`] if the accept loop task dies before
    ///   shutdown.
    ///
    /// Shutdown itself never fails.
    pub async fn start_and_wait(&self, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port()));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        tracing::info!(addr = %local_addr, "Server listening");

        let builder = self.connection_builder();
        let context = Arc::new(ConnectionContext {
            router: Arc::clone(&self.router),
            tracker: Arc::clone(&self.tracker),
            in_flight: self.in_flight.clone(),
            h2c_builder: builder.clone().http2_only(),
            builder,
            stop: ShutdownSignal::new(),
        });
        let stop = context.stop.clone();
        let accept = tokio::spawn(accept_loop(listener, context));

        if let Some(on_started) = self.config.on_started() {
            on_started(local_addr);
        }

        self.serve_until_shutdown(shutdown, stop, accept).await
    }

    /// Waits for `shutdown` or for the accept loop to end, then runs the
    /// shutdown sequence. A loop that fails first is reported without
    /// draining.
    async fn serve_until_shutdown(
        &self,
        shutdown: ShutdownSignal,
        stop: ShutdownSignal,
        mut accept: JoinHandle<io::Result<()>>,
    ) -> Result<(), ServerError> {
        tokio::select! {
            () = shutdown.recv() => {}
            joined = &mut accept => {
                return match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "Accept loop failed");
                        Err(ServerError::Serve(e))
                    }
                    Err(e) => Err(ServerError::ServeTask(e.to_string())),
                };
            }
        }

        tracing::info!("Shutdown requested, draining connections");
        self.router.announce_connection_close();
        self.drain().await;

        tracing::info!(
            in_flight = self.in_flight.count(),
            "Stopping backends and closing connections"
        );
        if let Some(grpc) = self.router.grpc() {
            grpc.graceful_stop().await;
        }
        stop.trigger();
        self.in_flight.wait_for_zero().await;

        match accept.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Accept loop failed during shutdown"),
            Err(e) => tracing::warn!(error = %e, "Accept loop task failed during shutdown"),
        }

        tracing::info!("Server stopped");
        Ok(())
    }

    async fn drain(&self) {
        let seconds = self.config.drain_seconds();

        for second in 0..seconds {
            let mut seen = self.tracker.open_connections() > 0;
            for _ in 0..DRAIN_POLLS_PER_SECOND {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                seen |= self.tracker.open_connections() > 0;
            }

            if !seen {
                tracing::debug!(elapsed_secs = second + 1, "No open connections, drain complete");
                return;
            }
        }

        let open = self.tracker.open_connections();
        if open > 0 {
            tracing::warn!(open, "Shutdown delay elapsed with connections still open");
        }
    }

    fn connection_builder(&self) -> ConnectionBuilder<TokioExecutor> {
        let mut builder = ConnectionBuilder::new(TokioExecutor::new());
        let max_header_bytes = self.config.max_header_bytes();

        builder
            .http1()
            .timer(TokioTimer::new())
            .max_buf_size(max_header_bytes.max(MIN_HTTP1_BUF_SIZE));

        let h2 = self.config.http2();
        let mut http2 = builder.http2();
        http2
            .timer(TokioTimer::new())
            .max_header_list_size(u32::try_from(max_header_bytes).unwrap_or(u32::MAX));
        if let Some(streams) = h2.max_concurrent_streams {
            http2.max_concurrent_streams(streams);
        }
        if let Some(size) = h2.initial_stream_window_size {
            http2.initial_stream_window_size(size);
        }
        if let Some(size) = h2.initial_connection_window_size {
            http2.initial_connection_window_size(size);
        }
        if let Some(size) = h2.max_frame_size {
            http2.max_frame_size(size);
        }
        if let Some(interval) = h2.keep_alive_interval {
            http2.keep_alive_interval(interval);
        }
        if let Some(timeout) = h2.keep_alive_timeout {
            http2.keep_alive_timeout(timeout);
        }

        builder
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("router", &self.router)
            .field("open_connections", &self.tracker.open_connections())
            .field("in_flight", &self.in_flight.count())
            .finish()
    }
}

/// Builder for [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
    router: ProtocolRouter,
}

impl ServerBuilder {
    /// Sets the server configuration.
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the gRPC backend.
    #[must_use]
    pub fn grpc_backend(mut self, backend: impl GrpcBackend) -> Self {
        self.router = self.router.with_grpc(backend);
        self
    }

    /// Sets the gRPC-Web backend. It is only consulted for paths naming a
    /// service of the gRPC backend.
    #[must_use]
    pub fn grpc_web_backend(mut self, backend: impl GrpcWebBackend) -> Self {
        self.router = self.router.with_grpc_web(backend);
        self
    }

    /// Sets the handler for all other requests.
    #[must_use]
    pub fn http_handler(mut self, handler: impl HttpHandler) -> Self {
        self.router = self.router.with_http(handler);
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        let router = self
            .router
            .allow_private_network(self.config.allow_private_network());

        Server {
            config: self.config,
            router: Arc::new(router),
            tracker: Arc::new(ConnStateTracker::new()),
            in_flight: InFlight::new(),
        }
    }
}

/// State shared by the accept loop and every connection task.
struct ConnectionContext {
    router: Arc<ProtocolRouter>,
    tracker: Arc<ConnStateTracker>,
    in_flight: InFlight,
    builder: ConnectionBuilder<TokioExecutor>,
    /// Same settings, HTTP/2 only, for connections upgraded to h2c.
    h2c_builder: ConnectionBuilder<TokioExecutor>,
    /// Stops the accept loop and asks every connection to shut down.
    stop: ShutdownSignal,
}

async fn accept_loop(listener: TcpListener, context: Arc<ConnectionContext>) -> io::Result<()> {
    let stop = context.stop.clone();
    let mut next_id: u64 = 0;
    let mut backoff = Duration::ZERO;

    loop {
        let accepted = tokio::select! {
            () = stop.recv() => return Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff = Duration::ZERO;
                next_id += 1;
                let id = ConnectionId::new(next_id, peer);
                tokio::spawn(serve_connection(Arc::clone(&context), stream, id));
            }
            Err(e) if is_transient_accept_error(&e) => {
                backoff = next_backoff(backoff);
                tracing::warn!(error = %e, retry_in = ?backoff, "Accept error, retrying");
                tokio::select! {
                    () = stop.recv() => return Ok(()),
                    () = tokio::time::sleep(backoff) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        ACCEPT_BACKOFF_START
    } else {
        (current * 2).min(ACCEPT_BACKOFF_MAX)
    }
}

fn is_transient_accept_error(error: &io::Error) -> bool {
    // ENFILE and EMFILE clear once other connections close.
    #[cfg(unix)]
    if matches!(error.raw_os_error(), Some(23 | 24)) {
        return true;
    }

    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn serve_connection(context: Arc<ConnectionContext>, stream: TcpStream, id: ConnectionId) {
    let monitor = Arc::new(ConnectionMonitor::new(id, Arc::clone(&context.tracker)));
    monitor.record(ConnState::New);

    let service = {
        let context = Arc::clone(&context);
        let monitor = Arc::clone(&monitor);
        service_fn(move |request| {
            handle_request(Arc::clone(&context), Arc::clone(&monitor), request)
        })
    };

    let conn = context
        .builder
        .serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut stopping = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            () = context.stop.recv(), if !stopping => {
                stopping = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection = %id, error = %e, "Connection closed with error");
    }
    monitor.record(ConnState::Closed);
}

/// Serves a connection that switched to HTTP/2 through `Upgrade: h2c`.
///
/// The connection was reported as hijacked, so its requests no longer move
/// it between active and idle. They are still counted as in flight.
async fn serve_upgraded(
    context: Arc<ConnectionContext>,
    monitor: Arc<ConnectionMonitor>,
    io: UpgradedStream<TokioIo<Upgraded>>,
) {
    let service = {
        let context = Arc::clone(&context);
        let monitor = Arc::clone(&monitor);
        service_fn(move |request| {
            handle_upgraded_request(Arc::clone(&context), Arc::clone(&monitor), request)
        })
    };

    let conn = context
        .h2c_builder
        .serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);

    let mut stopping = false;
    let result = loop {
        tokio::select! {
            result = conn.as_mut() => break result,
            () = context.stop.recv(), if !stopping => {
                stopping = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!(connection = %monitor.id, error = %e, "Upgraded connection closed with error");
    }
}

// Boxed so the upgraded connection's future type does not name
// `handle_request`'s, which spawns it.
fn handle_upgraded_request(
    context: Arc<ConnectionContext>,
    monitor: Arc<ConnectionMonitor>,
    request: Request<Incoming>,
) -> BoxFuture<'static, Result<Response<TrackedBody>, Infallible>> {
    Box::pin(handle_request(context, monitor, request))
}

async fn handle_request(
    context: Arc<ConnectionContext>,
    monitor: Arc<ConnectionMonitor>,
    request: Request<Incoming>,
) -> Result<Response<TrackedBody>, Infallible> {
    let guards = RequestGuards {
        _in_flight: context.in_flight.acquire(),
        _activity: monitor.begin_request(),
    };

    let http1 = request.version() < Version::HTTP_2;
    let response = if http1 && h2c::is_upgrade_request(&request) {
        upgrade_to_h2c(&context, &monitor, request).await
    } else {
        dispatch(&context, &monitor, request).await
    };

    if http1 && response.status() == StatusCode::SWITCHING_PROTOCOLS {
        monitor.record(ConnState::Hijacked);
    }

    Ok(response.map(|inner| TrackedBody {
        inner,
        _guards: guards,
    }))
}

async fn dispatch(
    context: &ConnectionContext,
    monitor: &ConnectionMonitor,
    request: Request<Incoming>,
) -> HttpResponse {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let request = request.map(|body| body.map_err(BoxError::from).boxed_unsync());

    match AssertUnwindSafe(context.router.dispatch(request))
        .catch_unwind()
        .await
    {
        Ok((route, response)) => {
            switchyard_telemetry::metrics::record_request(route.as_str());
            response
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                .unwrap_or("unknown panic");
            tracing::error!(
                connection = %monitor.id,
                http.method = %method,
                http.path = %path,
                panic = message,
                "Request handler panicked"
            );
            switchyard_telemetry::metrics::record_panic();
            internal_server_error()
        }
    }
}

/// Answers an h2c upgrade with 101 and serves the connection as HTTP/2 once
/// hyper hands it over. The request itself is answered on stream 1.
async fn upgrade_to_h2c(
    context: &Arc<ConnectionContext>,
    monitor: &Arc<ConnectionMonitor>,
    mut request: Request<Incoming>,
) -> HttpResponse {
    let on_upgrade = hyper::upgrade::on(&mut request);
    let (parts, body) = request.into_parts();
    let body = match Limited::new(body, h2c::MAX_UPGRADE_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(connection = %monitor.id, error = %e, "Failed to read h2c upgrade body");
            return bad_request();
        }
    };
    let stream_one = h2c::stream_one_frames(&parts, &body);

    let context = Arc::clone(context);
    let monitor = Arc::clone(monitor);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                tracing::debug!(connection = %monitor.id, path = %parts.uri.path(), "Connection upgraded to h2c");
                let io = UpgradedStream::new(TokioIo::new(upgraded), stream_one);
                serve_upgraded(context, monitor, io).await;
            }
            Err(e) => {
                tracing::debug!(connection = %monitor.id, error = %e, "h2c upgrade failed");
            }
        }
    });

    h2c::switching_protocols()
}

/// Reports one connection's lifecycle to the tracker.
///
/// Transitions are recorded under the monitor's lock so they reach the
/// tracker in the order they happened.
struct ConnectionMonitor {
    id: ConnectionId,
    tracker: Arc<ConnStateTracker>,
    active: Mutex<usize>,
}

impl ConnectionMonitor {
    fn new(id: ConnectionId, tracker: Arc<ConnStateTracker>) -> Self {
        Self {
            id,
            tracker,
            active: Mutex::new(0),
        }
    }

    fn record(&self, state: ConnState) {
        let _order = self.active.lock();
        self.tracker.record_transition(self.id, state);
    }

    fn begin_request(self: &Arc<Self>) -> RequestActivity {
        let mut active = self.active.lock();
        *active += 1;
        if *active == 1 {
            self.tracker.record_transition(self.id, ConnState::Active);
        }
        RequestActivity {
            monitor: Arc::clone(self),
        }
    }

    fn end_request(&self) {
        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.tracker.record_transition(self.id, ConnState::Idle);
        }
    }
}

/// Marks the connection active while a request executes.
struct RequestActivity {
    monitor: Arc<ConnectionMonitor>,
}

impl Drop for RequestActivity {
    fn drop(&mut self) {
        self.monitor.end_request();
    }
}

struct RequestGuards {
    _in_flight: InFlightGuard,
    _activity: RequestActivity,
}

/// Response body that keeps the request counted until it is finished or
/// dropped.
struct TrackedBody {
    inner: ResponseBody,
    _guards: RequestGuards,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
