//! # Switchyard Server
//!
//! One listener for gRPC, gRPC-Web, and plain HTTP.
//!
//! Every request is classified from its request line and headers and handed
//! to one of three injected backends:
//!
//! - [`GrpcBackend`] for native gRPC over HTTP/2
//! - [`GrpcWebBackend`] for gRPC-Web calls and their CORS preflights, with
//!   response compression
//! - [`HttpHandler`] for everything else
//!
//! HTTP/1.1 and cleartext HTTP/2 are served on the same port, the latter
//! with prior knowledge or through `Upgrade: h2c`. Shutdown drains
//! open connections for a bounded time before stopping the backends.
//!
//! ## Example
//!
//! ```rust,no_run
//! use switchyard_server::{full_body, HttpRequest, HttpResponse, Server, ServerConfig, ShutdownSignal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::builder()
//!         .port(8080)
//!         .on_started(|addr| println!("listening on {addr}"))
//!         .build();
//!
//!     let server = Server::builder()
//!         .config(config)
//!         .http_handler(|_req: HttpRequest| async { HttpResponse::new(full_body("OK")) })
//!         .build();
//!
//!     server.start_and_wait(ShutdownSignal::with_os_signals()).await?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/switchyard-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub mod backend;
pub mod compression;
pub mod config;
pub mod error;
mod h2c;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod tracker;

pub use backend::{GrpcBackend, GrpcWebBackend, HttpHandler};
pub use compression::{select_compression, CompressedBody, Compression, CompressionWriter};
pub use config::{Http2Settings, ServerConfig, ServerConfigBuilder};
pub use error::{CompressionError, ServerError};
pub use router::{ProtocolRouter, Route};
pub use server::{Server, ServerBuilder};
pub use shutdown::{InFlight, InFlightGuard, ShutdownSignal};
pub use tracker::{ConnState, ConnStateTracker, ConnectionId};

/// Type-erased error carried by request and response bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by the backend traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Body of a request handed to a backend.
pub type RequestBody = UnsyncBoxBody<Bytes, BoxError>;

/// Body of a response returned by a backend.
pub type ResponseBody = UnsyncBoxBody<Bytes, BoxError>;

/// Request type seen by every backend.
pub type HttpRequest = Request<RequestBody>;

/// Response type returned by every backend.
pub type HttpResponse = Response<ResponseBody>;

/// A response body holding `data` in one frame.
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A response body with no data.
#[must_use]
pub fn empty_body() -> ResponseBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}
