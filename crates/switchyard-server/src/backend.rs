//! Backends the protocol router dispatches to.
//!
//! The server does not speak the gRPC wire protocol or translate gRPC-Web
//! itself. Those are supplied as trait objects, together with the fallback
//! handler for everything else.
//!
//! # Example
//!
//! ```rust
//! use switchyard_server::{full_body, HttpRequest, HttpResponse, HttpHandler};
//!
//! async fn hello(_req: HttpRequest) -> HttpResponse {
//!     HttpResponse::new(full_body("OK"))
//! }
//!
//! fn assert_handler<H: HttpHandler>(_: H) {}
//! assert_handler(hello);
//! ```

use std::future::Future;

use http::header::{self, HeaderMap};
use http::Method;

use crate::{BoxFuture, HttpRequest, HttpResponse};

/// A gRPC server that the router hands native gRPC requests to.
///
/// Services are registered with the backend before it is given to the
/// server; the router only asks which service names exist.
pub trait GrpcBackend: Send + Sync + 'static {
    /// Fully-qualified names of the registered services
    /// (e.g. `helloworld.Greeter`).
    fn service_names(&self) -> Vec<String>;

    /// Returns `true` if `name` is a registered service.
    fn has_service(&self, name: &str) -> bool {
        self.service_names().iter().any(|s| s == name)
    }

    /// Serves one gRPC request.
    fn serve(&self, request: HttpRequest) -> BoxFuture<'_, HttpResponse>;

    /// Stops accepting new RPCs and completes once running RPCs have
    /// finished.
    fn graceful_stop(&self) -> BoxFuture<'_, ()>;
}

/// A gRPC-Web translation layer in front of the gRPC backend.
///
/// The default predicates follow the usual gRPC-Web conventions; override
/// them if the layer accepts other shapes.
pub trait GrpcWebBackend: Send + Sync + 'static {
    /// Returns `true` for a gRPC-Web call: a POST whose `Content-Type` starts
    /// with `application/grpc-web`.
    fn is_grpc_web_request(&self, request: &HttpRequest) -> bool {
        request.method() == Method::POST
            && request
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("application/grpc-web"))
    }

    /// Returns `true` for a CORS preflight that asks to send gRPC-Web
    /// headers.
    fn is_acceptable_grpc_cors_request(&self, request: &HttpRequest) -> bool {
        request.method() == Method::OPTIONS
            && request
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
            && requested_headers_contain(request.headers(), "x-grpc-web")
    }

    /// Serves one gRPC-Web request or preflight.
    fn serve(&self, request: HttpRequest) -> BoxFuture<'_, HttpResponse>;
}

fn requested_headers_contain(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|h| h.trim().eq_ignore_ascii_case(name))
}

/// Handler for requests that are neither gRPC nor gRPC-Web.
///
/// Implemented for any `Fn(HttpRequest) -> impl Future<Output = HttpResponse>`.
pub trait HttpHandler: Send + Sync + 'static {
    /// Handles one request.
    fn call(&self, request: HttpRequest) -> BoxFuture<'_, HttpResponse>;
}

impl<F, Fut> HttpHandler for F
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    fn call(&self, request: HttpRequest) -> BoxFuture<'_, HttpResponse> {
        Box::pin(self(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{empty_body, full_body};
    use http::Request;
    use http_body_util::BodyExt;

    struct Web;

    impl GrpcWebBackend for Web {
        fn serve(&self, _request: HttpRequest) -> BoxFuture<'_, HttpResponse> {
            Box::pin(async { HttpResponse::new(empty_body()) })
        }
    }

    struct Services(Vec<&'static str>);

    impl GrpcBackend for Services {
        fn service_names(&self) -> Vec<String> {
            self.0.iter().map(|s| (*s).to_string()).collect()
        }

        fn serve(&self, _request: HttpRequest) -> BoxFuture<'_, HttpResponse> {
            Box::pin(async { HttpResponse::new(empty_body()) })
        }

        fn graceful_stop(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    fn request(method: Method, headers: &[(&str, &str)]) -> HttpRequest {
        let mut builder = Request::builder().method(method).uri("/pkg.Svc/Call");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(empty_body()).unwrap()
    }

    #[test]
    fn test_has_service_default() {
        let backend = Services(vec!["pkg.Svc", "grpc.health.v1.Health"]);
        assert!(backend.has_service("pkg.Svc"));
        assert!(!backend.has_service("pkg"));
    }

    #[test]
    fn test_default_grpc_web_predicate() {
        let web = Web;
        assert!(web.is_grpc_web_request(&request(
            Method::POST,
            &[("content-type", "application/grpc-web-text")]
        )));
        assert!(!web.is_grpc_web_request(&request(
            Method::GET,
            &[("content-type", "application/grpc-web")]
        )));
        assert!(!web.is_grpc_web_request(&request(
            Method::POST,
            &[("content-type", "application/grpc")]
        )));
    }

    #[test]
    fn test_default_cors_predicate() {
        let web = Web;
        let preflight = request(
            Method::OPTIONS,
            &[
                ("access-control-request-method", "POST"),
                ("access-control-request-headers", "content-type, X-Grpc-Web"),
            ],
        );
        assert!(web.is_acceptable_grpc_cors_request(&preflight));

        let plain_preflight = request(
            Method::OPTIONS,
            &[
                ("access-control-request-method", "POST"),
                ("access-control-request-headers", "content-type"),
            ],
        );
        assert!(!web.is_acceptable_grpc_cors_request(&plain_preflight));
    }

    #[tokio::test]
    async fn test_closure_is_http_handler() {
        let handler = |req: HttpRequest| async move {
            HttpResponse::new(full_body(req.uri().path().to_string()))
        };

        let response = HttpHandler::call(&handler, request(Method::GET, &[])).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"/pkg.Svc/Call");
    }
}
