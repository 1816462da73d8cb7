//! Protocol router.
//!
//! Every request arriving on the shared listener is classified as native
//! gRPC, gRPC-Web, or plain HTTP, in that order of priority, and handed to
//! the matching backend. Classification only looks at the request line and
//! headers, and a request only reaches a gRPC backend if its path names a
//! registered service.
//!
//! # Example
//!
//! ```rust
//! use http::Request;
//! use switchyard_server::{empty_body, full_body, HttpRequest, HttpResponse, ProtocolRouter, Route};
//!
//! let router = ProtocolRouter::new()
//!     .with_http(|_req: HttpRequest| async { HttpResponse::new(full_body("OK")) });
//!
//! let request = Request::get("/index.html").body(empty_body()).unwrap();
//! assert_eq!(router.classify(&request), Route::Http);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::header::{self, HeaderValue};
use http::{Method, StatusCode, Version};

use crate::backend::{GrpcBackend, GrpcWebBackend, HttpHandler};
use crate::compression::compress_response;
use crate::{full_body, HttpRequest, HttpResponse};

/// `Content-Type` of a native gRPC request.
pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Header granting private-network CORS access.
pub const ALLOW_PRIVATE_NETWORK: &str = "access-control-allow-private-network";

/// Where a request was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// Native gRPC over HTTP/2.
    Grpc,
    /// gRPC-Web, including its CORS preflights.
    GrpcWeb,
    /// The fallback HTTP handler.
    Http,
    /// Nothing matched; answered with 404.
    NotFound,
}

impl Route {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Grpc => "grpc",
            Self::GrpcWeb => "grpc_web",
            Self::Http => "http",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extracts the service name from a `/service/method` path.
///
/// The path must be at least four bytes long, start with `/`, and contain a
/// second `/`; the text between the two is the service name.
///
/// ```rust
/// use switchyard_server::router::grpc_service_name;
///
/// assert_eq!(grpc_service_name("/helloworld.Greeter/SayHello"), Some("helloworld.Greeter"));
/// assert_eq!(grpc_service_name("/a/b"), Some("a"));
/// assert_eq!(grpc_service_name("/ab"), None);
/// assert_eq!(grpc_service_name("/abcdef"), None);
/// ```
#[must_use]
pub fn grpc_service_name(path: &str) -> Option<&str> {
    if path.len() < 4 {
        return None;
    }
    let rest = path.strip_prefix('/')?;
    rest.split_once('/').map(|(service, _)| service)
}

enum Target<'a> {
    Grpc(&'a dyn GrpcBackend),
    GrpcWeb(&'a dyn GrpcWebBackend),
    Http(&'a dyn HttpHandler),
    NotFound,
}

impl Target<'_> {
    fn route(&self) -> Route {
        match self {
            Self::Grpc(_) => Route::Grpc,
            Self::GrpcWeb(_) => Route::GrpcWeb,
            Self::Http(_) => Route::Http,
            Self::NotFound => Route::NotFound,
        }
    }
}

/// Classifies requests and dispatches them to the configured backends.
///
/// Any backend may be absent. Both gRPC branches need the gRPC backend,
/// since it owns the registered-service set that paths are checked against.
#[derive(Default)]
pub struct ProtocolRouter {
    grpc: Option<Arc<dyn GrpcBackend>>,
    grpc_web: Option<Arc<dyn GrpcWebBackend>>,
    http: Option<Arc<dyn HttpHandler>>,
    allow_private_network: bool,
    connection_close: AtomicBool,
}

impl ProtocolRouter {
    /// Creates a router with no backends; every request gets a 404.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the gRPC backend.
    #[must_use]
    pub fn with_grpc(self, backend: impl GrpcBackend) -> Self {
        self.with_grpc_arc(Arc::new(backend))
    }

    /// Sets a shared gRPC backend.
    #[must_use]
    pub fn with_grpc_arc(mut self, backend: Arc<dyn GrpcBackend>) -> Self {
        self.grpc = Some(backend);
        self
    }

    /// Sets the gRPC-Web backend.
    #[must_use]
    pub fn with_grpc_web(mut self, backend: impl GrpcWebBackend) -> Self {
        self.grpc_web = Some(Arc::new(backend));
        self
    }

    /// Sets the fallback HTTP handler.
    #[must_use]
    pub fn with_http(mut self, handler: impl HttpHandler) -> Self {
        self.http = Some(Arc::new(handler));
        self
    }

    /// Adds `Access-Control-Allow-Private-Network: true` to gRPC-Web responses.
    #[must_use]
    pub fn allow_private_network(mut self, allow: bool) -> Self {
        self.allow_private_network = allow;
        self
    }

    /// The gRPC backend, if configured.
    #[must_use]
    pub fn grpc(&self) -> Option<&Arc<dyn GrpcBackend>> {
        self.grpc.as_ref()
    }

    /// From now on, plain HTTP/1.x responses ask the client to close the
    /// connection. Keep-alive is not switched off outright, so idle
    /// connections are not dropped mid-handshake.
    pub fn announce_connection_close(&self) {
        self.connection_close.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once [`announce_connection_close`](Self::announce_connection_close)
    /// has been called.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.connection_close.load(Ordering::SeqCst)
    }

    /// Decides where `request` would be dispatched.
    #[must_use]
    pub fn classify(&self, request: &HttpRequest) -> Route {
        self.target(request).route()
    }

    /// Dispatches `request` and returns the route taken with the response.
    pub async fn dispatch(&self, request: HttpRequest) -> (Route, HttpResponse) {
        let target = self.target(&request);
        let route = target.route();

        tracing::debug!(
            route = route.as_str(),
            http.method = %request.method(),
            http.path = request.uri().path(),
            "Dispatching request"
        );

        let response = match target {
            Target::Grpc(backend) => backend.serve(request).await,
            Target::GrpcWeb(backend) => self.serve_grpc_web(backend, request).await,
            Target::Http(handler) => self.serve_http(handler, request).await,
            Target::NotFound => not_found(),
        };

        (route, response)
    }

    fn target(&self, request: &HttpRequest) -> Target<'_> {
        if let Some(grpc) = &self.grpc {
            if is_grpc(request) && self.is_registered_path(request) {
                return Target::Grpc(grpc.as_ref());
            }
        }

        if let Some(web) = &self.grpc_web {
            if (web.is_grpc_web_request(request) || web.is_acceptable_grpc_cors_request(request))
                && self.is_registered_path(request)
            {
                return Target::GrpcWeb(web.as_ref());
            }
        }

        match &self.http {
            Some(handler) => Target::Http(handler.as_ref()),
            None => Target::NotFound,
        }
    }

    fn is_registered_path(&self, request: &HttpRequest) -> bool {
        let Some(grpc) = &self.grpc else {
            return false;
        };
        grpc_service_name(request.uri().path()).is_some_and(|service| grpc.has_service(service))
    }

    async fn serve_grpc_web(
        &self,
        backend: &dyn GrpcWebBackend,
        request: HttpRequest,
    ) -> HttpResponse {
        let accept_encoding: Vec<HeaderValue> = request
            .headers()
            .get_all(header::ACCEPT_ENCODING)
            .iter()
            .cloned()
            .collect();

        let mut response = backend.serve(request).await;
        if self.allow_private_network {
            response
                .headers_mut()
                .insert(ALLOW_PRIVATE_NETWORK, HeaderValue::from_static("true"));
        }

        compress_response(accept_encoding, response).await
    }

    async fn serve_http(&self, handler: &dyn HttpHandler, request: HttpRequest) -> HttpResponse {
        let http1 = request.version() < Version::HTTP_2;
        let mut response = handler.call(request).await;

        if http1 && self.is_draining() {
            response
                .headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        response
    }
}

impl fmt::Debug for ProtocolRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRouter")
            .field("grpc", &self.grpc.is_some())
            .field("grpc_web", &self.grpc_web.is_some())
            .field("http", &self.http.is_some())
            .field("allow_private_network", &self.allow_private_network)
            .field("draining", &self.is_draining())
            .finish()
    }
}

fn is_grpc(request: &HttpRequest) -> bool {
    request.version() >= Version::HTTP_2
        && request.method() == Method::POST
        && request
            .headers()
            .get(header::CONTENT_TYPE)
            .is_some_and(|ct| ct == GRPC_CONTENT_TYPE)
}

/// 404 response matching the conventional plain-text body.
pub(crate) fn not_found() -> HttpResponse {
    text_response(StatusCode::NOT_FOUND, "404 page not found\n")
}

pub(crate) fn bad_request() -> HttpResponse {
    text_response(StatusCode::BAD_REQUEST, "400 Bad Request\n")
}

/// 500 response used when a backend panics.
pub(crate) fn internal_server_error() -> HttpResponse {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
}

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = HttpResponse::new(full_body(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response
}
