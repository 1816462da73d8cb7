//! End-to-end server tests.
//!
//! Each test starts a real server on an ephemeral port and talks to it with
//! hyper's HTTP/1 and HTTP/2 client connections:
//!
//! 1. Plain HTTP requests and the not-found fallback
//! 2. Native gRPC over cleartext HTTP/2
//! 3. gRPC-Web with response compression
//! 4. Panic recovery
//! 5. Connection tracking and the shutdown sequence
//! 6. HTTP/1.1 `Upgrade: h2c`, spoken over a raw socket

use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use switchyard_server::{
    empty_body, full_body, BoxFuture, ConnState, GrpcBackend, GrpcWebBackend, HttpRequest,
    HttpResponse, Server, ServerBuilder, ServerConfig, ServerConfigBuilder, ServerError,
    ShutdownSignal,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<Server>,
    addr: SocketAddr,
    shutdown: ShutdownSignal,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(builder: ServerBuilder, config: ServerConfigBuilder) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = config
            .port(0)
            .on_started(move |addr| {
                let _ = tx.send(addr);
            })
            .build();

        let server = Arc::new(builder.config(config).build());
        let shutdown = ShutdownSignal::new();
        let task = {
            let server = Arc::clone(&server);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.start_and_wait(shutdown).await })
        };

        let bound = timeout(STEP_TIMEOUT, rx.recv())
            .await
            .expect("server should start")
            .expect("on_started should report the bound address");
        assert_ne!(bound.port(), 0);

        Self {
            server,
            addr: SocketAddr::from(([127, 0, 0, 1], bound.port())),
            shutdown,
            task,
        }
    }

    async fn stop(self) -> Result<(), ServerError> {
        self.shutdown.trigger();
        timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server should stop")
            .expect("server task should not panic")
    }
}

type Http1Sender = hyper::client::conn::http1::SendRequest<Full<Bytes>>;
type Http2Sender = hyper::client::conn::http2::SendRequest<Full<Bytes>>;

async fn connect_http1(addr: SocketAddr) -> Http1Sender {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender
}

async fn connect_http2(addr: SocketAddr) -> Http2Sender {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);
    sender
}

async fn body_bytes(response: Response<Incoming>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn get(path: &str) -> Request<Full<Bytes>> {
    Request::get(path)
        .header(header::HOST, "localhost")
        .body(Full::default())
        .unwrap()
}

fn drain_for(secs: u64) -> ServerConfigBuilder {
    ServerConfig::builder().shutdown_delay(Duration::from_secs(secs))
}

fn ok_handler(req: HttpRequest) -> impl std::future::Future<Output = HttpResponse> {
    let should_panic = req.uri().path() == "/panic";
    async move {
        if should_panic {
            panic!("handler blew up");
        }
        HttpResponse::new(full_body("OK"))
    }
}

fn grpc_web_frame(len: u32) -> Vec<u8> {
    let mut frame = vec![0u8];
    frame.extend_from_slice(&len.to_be_bytes());
    frame.resize(5 + len as usize, b'z');
    frame
}

#[derive(Clone, Default)]
struct Calls(Arc<AtomicUsize>);

impl Calls {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

struct Greeter {
    calls: Calls,
    stopped: Calls,
}

impl GrpcBackend for Greeter {
    fn service_names(&self) -> Vec<String> {
        vec!["helloworld.Greeter".to_string()]
    }

    fn serve(&self, _request: HttpRequest) -> BoxFuture<'_, HttpResponse> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {
            let mut response = HttpResponse::new(full_body(vec![0u8, 0, 0, 0, 0]));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
            response
        })
    }

    fn graceful_stop(&self) -> BoxFuture<'_, ()> {
        self.stopped.0.fetch_add(1, Ordering::SeqCst);
        Box::pin(async {})
    }
}

struct GreeterWeb {
    payload: Vec<u8>,
}

impl GrpcWebBackend for GreeterWeb {
    fn serve(&self, _request: HttpRequest) -> BoxFuture<'_, HttpResponse> {
        let payload = self.payload.clone();
        Box::pin(async move {
            let mut response = HttpResponse::new(full_body(payload));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/grpc-web+proto"),
            );
            response
        })
    }
}

fn greeter() -> (Greeter, Calls, Calls) {
    let calls = Calls::default();
    let stopped = Calls::default();
    let backend = Greeter {
        calls: calls.clone(),
        stopped: stopped.clone(),
    };
    (backend, calls, stopped)
}

#[tokio::test]
async fn test_plain_http_get_returns_ok() {
    let server = TestServer::start(
        Server::builder().http_handler(ok_handler),
        drain_for(2),
    )
    .await;

    let mut sender = connect_http1(server.addr).await;
    let response = sender.send_request(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(header::CONTENT_ENCODING));
    assert!(!response.headers().contains_key(header::CONNECTION));
    assert_eq!(body_bytes(response).await.as_ref(), b"OK");

    drop(sender);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_no_handler_returns_404() {
    let server = TestServer::start(Server::builder(), drain_for(1)).await;

    let mut sender = connect_http1(server.addr).await;
    let response = sender.send_request(get("/missing")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/plain; charset=utf-8"
    );
    assert_eq!(body_bytes(response).await.as_ref(), b"404 page not found\n");

    drop(sender);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_grpc_over_h2c_reaches_backend() {
    let (backend, calls, stopped) = greeter();
    let http_calls = Calls::default();
    let handler_calls = http_calls.clone();

    let server = TestServer::start(
        Server::builder()
            .grpc_backend(backend)
            .http_handler(move |_req: HttpRequest| {
                handler_calls.0.fetch_add(1, Ordering::SeqCst);
                async { HttpResponse::new(full_body("OK")) }
            }),
        drain_for(1),
    )
    .await;
    assert_eq!(server.server.service_names(), vec!["helloworld.Greeter"]);

    let mut sender = connect_http2(server.addr).await;
    let request = Request::post("http://localhost/helloworld.Greeter/SayHello")
        .header(header::CONTENT_TYPE, "application/grpc")
        .body(Full::new(Bytes::from_static(&[0, 0, 0, 0, 0])))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/grpc");
    assert_eq!(calls.count(), 1);
    assert_eq!(http_calls.count(), 0);

    let request = Request::post("http://localhost/other.Service/Call")
        .header(header::CONTENT_TYPE, "application/grpc")
        .body(Full::default())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(body_bytes(response).await.as_ref(), b"OK");
    assert_eq!(calls.count(), 1);
    assert_eq!(http_calls.count(), 1);

    drop(sender);
    server.stop().await.unwrap();
    assert_eq!(stopped.count(), 1);
}

#[tokio::test]
async fn test_grpc_web_response_is_compressed() {
    let (backend, _, _) = greeter();
    let payload = grpc_web_frame(1024);

    let server = TestServer::start(
        Server::builder()
            .grpc_backend(backend)
            .grpc_web_backend(GreeterWeb {
                payload: payload.clone(),
            })
            .http_handler(ok_handler),
        drain_for(1),
    )
    .await;

    let mut sender = connect_http1(server.addr).await;
    let request = Request::post("/helloworld.Greeter/SayHello")
        .header(header::HOST, "localhost")
        .header(header::CONTENT_TYPE, "application/grpc-web+proto")
        .header(header::ACCEPT_ENCODING, "gzip, br")
        .body(Full::new(Bytes::from(grpc_web_frame(4))))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_ENCODING], "br");
    assert_eq!(response.headers().get_all(header::VARY).iter().count(), 1);
    assert!(!response
        .headers()
        .contains_key("access-control-allow-private-network"));

    let compressed = body_bytes(response).await;
    let mut decoded = Vec::new();
    brotli::Decompressor::new(compressed.as_ref(), 4096)
        .read_to_end(&mut decoded)
        .unwrap();
    assert_eq!(decoded, payload);

    drop(sender);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_grpc_web_private_network_header() {
    let (backend, _, _) = greeter();

    let server = TestServer::start(
        Server::builder()
            .grpc_backend(backend)
            .grpc_web_backend(GreeterWeb {
                payload: grpc_web_frame(8),
            }),
        drain_for(1).allow_private_network(true),
    )
    .await;

    let mut sender = connect_http1(server.addr).await;
    let request = Request::post("/helloworld.Greeter/SayHello")
        .header(header::HOST, "localhost")
        .header(header::CONTENT_TYPE, "application/grpc-web")
        .header(header::ACCEPT_ENCODING, "br")
        .body(Full::default())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.headers()["access-control-allow-private-network"], "true");
    assert!(!response.headers().contains_key(header::CONTENT_ENCODING));
    assert_eq!(response.headers()[header::VARY], "Accept-Encoding");
    assert_eq!(body_bytes(response).await.as_ref(), grpc_web_frame(8).as_slice());

    drop(sender);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_returns_500() {
    let server = TestServer::start(
        Server::builder().http_handler(ok_handler),
        drain_for(1),
    )
    .await;

    let mut sender = connect_http1(server.addr).await;
    let response = sender.send_request(get("/panic")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_bytes(response).await.as_ref(), b"Internal Server Error\n");

    // The connection and the server survive the panic.
    let response = sender.send_request(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await.as_ref(), b"OK");
    assert_eq!(server.server.in_flight().count(), 0);

    drop(sender);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_conn_states_follow_connection() {
    let server = TestServer::start(
        Server::builder().http_handler(ok_handler),
        drain_for(1),
    )
    .await;

    let mut sender = connect_http1(server.addr).await;
    let response = sender.send_request(get("/")).await.unwrap();
    body_bytes(response).await;

    timeout(STEP_TIMEOUT, async {
        loop {
            let states = server.server.conn_states();
            if states.len() == 1 && states.values().all(|s| *s == ConnState::Idle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection should be tracked as idle");

    drop(sender);

    timeout(STEP_TIMEOUT, async {
        while !server.server.conn_states().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed connection should be removed");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_without_connections_returns_after_one_second() {
    let server = TestServer::start(
        Server::builder().http_handler(ok_handler),
        drain_for(2),
    )
    .await;

    let started = Instant::now();
    server.stop().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(900), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1900), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_draining_http1_response_asks_to_close() {
    let server = TestServer::start(
        Server::builder().http_handler(ok_handler),
        drain_for(3),
    )
    .await;

    let mut sender = connect_http1(server.addr).await;
    let response = sender.send_request(get("/")).await.unwrap();
    assert!(!response.headers().contains_key(header::CONNECTION));
    body_bytes(response).await;

    server.shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = sender.send_request(get("/")).await.unwrap();
    assert_eq!(response.headers()[header::CONNECTION], "close");
    assert_eq!(body_bytes(response).await.as_ref(), b"OK");

    timeout(Duration::from_secs(10), server.task)
        .await
        .expect("server should stop")
        .expect("server task should not panic")
        .unwrap();
}

/// Minimal HTTP/2 frame reader over a raw socket.
struct RawConnection {
    stream: TcpStream,
    buf: Vec<u8>,
}

struct RawFrame {
    kind: u8,
    flags: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

impl RawConnection {
    async fn fill(&mut self, len: usize) {
        while self.buf.len() < len {
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn read_head(&mut self) -> String {
        loop {
            if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head: Vec<u8> = self.buf.drain(..end + 4).collect();
                return String::from_utf8(head).unwrap();
            }
            let len = self.buf.len() + 1;
            self.fill(len).await;
        }
    }

    async fn read_frame(&mut self) -> RawFrame {
        self.fill(9).await;
        let len = u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
        self.fill(9 + len).await;
        let frame: Vec<u8> = self.buf.drain(..9 + len).collect();
        RawFrame {
            kind: frame[3],
            flags: frame[4],
            stream_id: u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) & 0x7fff_ffff,
            payload: frame[9..].to_vec(),
        }
    }
}

#[tokio::test]
async fn test_h2c_upgrade_answers_request_over_http2() {
    let server = TestServer::start(
        Server::builder().http_handler(|req: HttpRequest| {
            let line = format!(
                "{:?} {}",
                req.version(),
                req.uri().path_and_query().map_or("/", |p| p.as_str())
            );
            async move { HttpResponse::new(full_body(line)) }
        }),
        drain_for(1),
    )
    .await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let mut conn = RawConnection {
        stream,
        buf: Vec::new(),
    };
    conn.stream
        .write_all(
            b"GET /upgrade?x=1 HTTP/1.1\r\n\
              Host: localhost\r\n\
              Connection: Upgrade, HTTP2-Settings\r\n\
              Upgrade: h2c\r\n\
              HTTP2-Settings: AAMAAABkAARAAAAAAAIAAAAA\r\n\r\n",
        )
        .await
        .unwrap();

    let head = timeout(STEP_TIMEOUT, conn.read_head()).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "head {head:?}");
    assert!(head.to_ascii_lowercase().contains("upgrade: h2c"), "head {head:?}");

    // Client connection preface followed by an empty SETTINGS frame.
    conn.stream
        .write_all(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n\0\0\0\x04\0\0\0\0\0")
        .await
        .unwrap();

    let first = timeout(STEP_TIMEOUT, conn.read_frame()).await.unwrap();
    assert_eq!(first.kind, 0x4, "server preface must start with SETTINGS");
    assert_eq!(first.flags & 0x1, 0);

    let mut status_seen = false;
    let mut body = Vec::new();
    timeout(STEP_TIMEOUT, async {
        loop {
            let frame = conn.read_frame().await;
            if frame.stream_id != 1 {
                continue;
            }
            match frame.kind {
                // HEADERS: ":status: 200" is static table entry 8.
                0x1 => status_seen = frame.payload.first() == Some(&0x88),
                0x0 => {
                    body.extend_from_slice(&frame.payload);
                    if frame.flags & 0x1 != 0 {
                        break;
                    }
                }
                0x8 => {}
                other => panic!("unexpected frame type {other} on stream 1"),
            }
        }
    })
    .await
    .expect("stream 1 should be answered");

    assert!(status_seen);
    assert_eq!(body, b"HTTP/2.0 /upgrade?x=1");

    // The upgraded connection is hijacked and no longer tracked.
    timeout(STEP_TIMEOUT, async {
        while !server.server.conn_states().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("hijacked connection should be untracked");

    drop(conn);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let occupied = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let server = Server::builder()
        .config(ServerConfig::builder().port(port).build())
        .http_handler(|_req: HttpRequest| async { HttpResponse::new(empty_body()) })
        .build();

    let err = timeout(STEP_TIMEOUT, server.start_and_wait(ShutdownSignal::new()))
        .await
        .expect("bind failure should be immediate")
        .unwrap_err();

    match err {
        ServerError::Bind { addr, .. } => assert_eq!(addr.port(), port),
        other => panic!("expected bind error, got {other:?}"),
    }
}
