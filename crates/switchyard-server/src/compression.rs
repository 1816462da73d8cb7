//! gRPC-Web response compression.
//!
//! gRPC-Web responses are a stream of length-prefixed frames: one flag byte
//! followed by a big-endian `u32` payload length. The first chunk a backend
//! writes therefore tells us how large the first message is, and small
//! messages are not worth compressing.
//!
//! [`CompressionWriter`] makes that decision on the first write and from then
//! on forwards everything through the chosen encoder. [`compress_response`]
//! applies it to a streaming response body, holding the first data frame
//! until the response head reflects the decision.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use http::header::{self, HeaderMap, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame};
use parking_lot::Mutex;

use crate::error::CompressionError;
use crate::{BoxError, HttpResponse};

/// Smallest first gRPC-Web message, in bytes, that gets compressed.
pub const MIN_COMPRESS_SIZE: u32 = 512;

/// Content-Type prefix shared by all gRPC-Web responses.
pub const GRPC_WEB_CONTENT_TYPE: &str = "application/grpc-web";

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 6;
const BROTLI_LG_WINDOW: u32 = 16;

/// Outcome of the compression decision for one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Bytes pass through unchanged.
    None,
    /// Brotli (`Content-Encoding: br`).
    Brotli,
    /// Gzip (`Content-Encoding: gzip`).
    Gzip,
}

impl Compression {
    /// `Content-Encoding` value for this algorithm, if any.
    #[must_use]
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Brotli => Some("br"),
            Self::Gzip => Some("gzip"),
        }
    }
}

/// Decides how a gRPC-Web response is encoded.
///
/// `first_write` is the first chunk of the response body; `accept_encoding`
/// holds every `Accept-Encoding` value of the request. Brotli wins over gzip
/// when both are accepted.
///
/// # Example
///
/// ```rust
/// use http::HeaderValue;
/// use switchyard_server::compression::{select_compression, Compression};
///
/// let frame = [0, 0, 0, 4, 0]; // 1024-byte message
/// let accept = [HeaderValue::from_static("gzip, br")];
///
/// assert_eq!(
///     select_compression(Some("application/grpc-web+proto"), &frame, &accept),
///     Compression::Brotli,
/// );
/// ```
#[must_use]
pub fn select_compression(
    content_type: Option<&str>,
    first_write: &[u8],
    accept_encoding: &[HeaderValue],
) -> Compression {
    if !content_type.is_some_and(|ct| ct.starts_with(GRPC_WEB_CONTENT_TYPE)) {
        return Compression::None;
    }

    let Some(length) = first_write.get(1..5) else {
        return Compression::None;
    };
    let length = u32::from_be_bytes([length[0], length[1], length[2], length[3]]);
    if length < MIN_COMPRESS_SIZE {
        return Compression::None;
    }

    if accepts_encoding(accept_encoding, "br") {
        Compression::Brotli
    } else if accepts_encoding(accept_encoding, "gzip") {
        Compression::Gzip
    } else {
        Compression::None
    }
}

/// Whether `Accept-Encoding` values allow `coding`.
///
/// A coding listed with `q=0` is refused. Other weights only express
/// preference and are not compared.
fn accepts_encoding(values: &[HeaderValue], coding: &str) -> bool {
    values
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|item| {
            let mut parts = item.split(';');
            let name = parts.next()?.trim();
            if !name.eq_ignore_ascii_case(coding) {
                return None;
            }
            let quality = parts
                .filter_map(|param| param.split_once('='))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("q"))
                .map_or(1.0, |(_, value)| value.trim().parse::<f32>().unwrap_or(1.0));
            Some(quality)
        })
        .any(|quality| quality > 0.0)
}

/// Case-insensitive search for `token` in comma-separated header values.
fn values_contain_token<'a>(values: impl IntoIterator<Item = &'a HeaderValue>, token: &str) -> bool {
    values
        .into_iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|item| item.split(';').next().unwrap_or_default().trim())
        .any(|item| item.eq_ignore_ascii_case(token))
}

enum Encoder<W: Write> {
    /// No write seen yet.
    Pending(W),
    Identity(W),
    Brotli(Box<brotli::CompressorWriter<W>>),
    Gzip(GzEncoder<W>),
    Closed,
}

/// A response sink that picks its encoding on the first write.
///
/// The writer owns the response headers until the decision is made, since
/// the decision rewrites them: `Content-Encoding` is set and `Content-Length`
/// dropped when compressing, and `Accept-Encoding` is added to `Vary` once.
pub struct CompressionWriter<W: Write> {
    accept_encoding: Vec<HeaderValue>,
    headers: HeaderMap,
    decision: Option<Compression>,
    encoder: Encoder<W>,
}

impl<W: Write> CompressionWriter<W> {
    /// Wraps `sink`, deciding later from the request's `Accept-Encoding`
    /// values and the response `headers`.
    pub fn new(sink: W, accept_encoding: Vec<HeaderValue>, headers: HeaderMap) -> Self {
        Self {
            accept_encoding,
            headers,
            decision: None,
            encoder: Encoder::Pending(sink),
        }
    }

    /// The response headers, including any changes made by the decision.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the response headers. Changes made after the first
    /// write do not affect the decision.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Moves the headers out, leaving an empty map behind.
    pub fn take_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.headers)
    }

    /// The decision, once the first write has happened.
    pub fn decision(&self) -> Option<Compression> {
        self.decision
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        matches!(self.encoder, Encoder::Closed)
    }

    /// Writes all of `data`, deciding the encoding first if this is the first
    /// write.
    ///
    /// # Errors
    ///
    /// `CompressionError::Closed` after [`close`](Self::close), or
    /// `CompressionError::Io` if the encoder or the sink fails.
    pub fn write(&mut self, data: &[u8]) -> Result<(), CompressionError> {
        if matches!(self.encoder, Encoder::Pending(_)) {
            self.decide(data);
        }

        match &mut self.encoder {
            Encoder::Pending(w) | Encoder::Identity(w) => w.write_all(data)?,
            Encoder::Brotli(w) => w.write_all(data)?,
            Encoder::Gzip(w) => w.write_all(data)?,
            Encoder::Closed => return Err(CompressionError::Closed),
        }

        Ok(())
    }

    /// Pushes buffered compressed output to the sink without ending the
    /// stream.
    ///
    /// # Errors
    ///
    /// `CompressionError::Closed` after [`close`](Self::close), or
    /// `CompressionError::Io` if the encoder or the sink fails.
    pub fn flush(&mut self) -> Result<(), CompressionError> {
        match &mut self.encoder {
            Encoder::Pending(w) | Encoder::Identity(w) => w.flush()?,
            Encoder::Brotli(w) => w.flush()?,
            Encoder::Gzip(w) => w.flush()?,
            Encoder::Closed => return Err(CompressionError::Closed),
        }

        Ok(())
    }

    /// Finishes the encoder, writing any trailer it needs. Idempotent.
    ///
    /// # Errors
    ///
    /// `CompressionError::Io` if finishing fails; the writer is closed
    /// regardless.
    pub fn close(&mut self) -> Result<(), CompressionError> {
        match std::mem::replace(&mut self.encoder, Encoder::Closed) {
            Encoder::Closed => {}
            Encoder::Pending(mut w) | Encoder::Identity(mut w) => w.flush()?,
            Encoder::Brotli(w) => {
                // into_inner finishes the brotli stream.
                let mut sink = w.into_inner();
                sink.flush()?;
            }
            Encoder::Gzip(w) => {
                let mut sink = w.finish()?;
                sink.flush()?;
            }
        }

        Ok(())
    }

    fn decide(&mut self, first_write: &[u8]) {
        let Encoder::Pending(sink) = std::mem::replace(&mut self.encoder, Encoder::Closed) else {
            return;
        };

        let content_type = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        let decision = select_compression(content_type, first_write, &self.accept_encoding);

        self.encoder = match decision {
            Compression::None => Encoder::Identity(sink),
            Compression::Brotli => Encoder::Brotli(Box::new(brotli::CompressorWriter::new(
                sink,
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LG_WINDOW,
            ))),
            Compression::Gzip => {
                Encoder::Gzip(GzEncoder::new(sink, flate2::Compression::default()))
            }
        };

        if let Some(encoding) = decision.content_encoding() {
            self.headers
                .insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
            self.headers.remove(header::CONTENT_LENGTH);
        }

        if !values_contain_token(self.headers.get_all(header::VARY), "Accept-Encoding") {
            self.headers
                .append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        }

        self.decision = Some(decision);
    }
}

impl<W: Write> std::fmt::Debug for CompressionWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionWriter")
            .field("decision", &self.decision)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// In-memory sink shared between a [`CompressionWriter`] and the body that
/// drains it.
#[derive(Debug, Clone, Default)]
struct SharedBuffer(Arc<Mutex<BytesMut>>);

impl SharedBuffer {
    fn take(&self) -> Bytes {
        self.0.lock().split().freeze()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs a gRPC-Web response through a [`CompressionWriter`].
///
/// Waits for the first non-empty data frame, lets the writer decide, and
/// returns the response with its head rewritten and a [`CompressedBody`].
/// A response whose body ends, fails, or yields trailers before any data is
/// returned with its head untouched.
pub async fn compress_response(
    accept_encoding: Vec<HeaderValue>,
    response: HttpResponse,
) -> HttpResponse {
    let (mut parts, mut body) = response.into_parts();

    let mut held = VecDeque::new();
    let first = loop {
        match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) if data.is_empty() => {}
                Ok(data) => break Some(data),
                Err(frame) => {
                    held.push_back(Ok(frame));
                    break None;
                }
            },
            Some(Err(e)) => {
                held.push_back(Err(e));
                break None;
            }
            None => break None,
        }
    };

    let Some(first) = first else {
        let body = ReplayBody { held, inner: body }.boxed_unsync();
        return HttpResponse::from_parts(parts, body);
    };

    let buffer = SharedBuffer::default();
    let headers = std::mem::take(&mut parts.headers);
    let mut compressed = CompressedBody {
        inner: body,
        writer: CompressionWriter::new(buffer.clone(), accept_encoding, headers),
        buffer,
        queued: VecDeque::new(),
        done: false,
    };

    if let Err(e) = compressed.write_chunk(&first) {
        compressed.fail(e);
    }
    parts.headers = compressed.writer.take_headers();

    HttpResponse::from_parts(parts, compressed.boxed_unsync())
}

/// Response body that streams its inner body through a [`CompressionWriter`].
///
/// Compressed output is flushed after every data frame so streamed messages
/// reach the client promptly. Trailers are forwarded after the compressed
/// data, once the encoder has been finished.
pub struct CompressedBody {
    inner: crate::ResponseBody,
    writer: CompressionWriter<SharedBuffer>,
    buffer: SharedBuffer,
    queued: VecDeque<Result<Frame<Bytes>, BoxError>>,
    done: bool,
}

impl CompressedBody {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), CompressionError> {
        self.writer.write(data)?;
        self.writer.flush()?;
        self.drain_buffer();
        Ok(())
    }

    fn finish(&mut self, trailers: Option<HeaderMap>) {
        self.done = true;
        if let Err(e) = self.writer.close() {
            self.fail(e);
            return;
        }
        self.drain_buffer();
        if let Some(trailers) = trailers {
            self.queued.push_back(Ok(Frame::trailers(trailers)));
        }
    }

    fn fail(&mut self, error: CompressionError) {
        tracing::debug!(error = %error, "gRPC-Web response compression failed");
        self.done = true;
        self.queued.push_back(Err(Box::new(error)));
    }

    fn drain_buffer(&mut self) {
        let chunk = self.buffer.take();
        if !chunk.is_empty() {
            self.queued.push_back(Ok(Frame::data(chunk)));
        }
    }
}

impl Body for CompressedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            if let Some(frame) = this.queued.pop_front() {
                return Poll::Ready(Some(frame));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        if let Err(e) = this.write_chunk(&data) {
                            this.fail(e);
                        }
                    }
                    Err(frame) => {
                        if let Ok(trailers) = frame.into_trailers() {
                            this.finish(Some(trailers));
                        }
                    }
                },
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => this.finish(None),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done && self.queued.is_empty()
    }
}

impl std::fmt::Debug for CompressedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedBody")
            .field("writer", &self.writer)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Replays frames consumed while peeking, then continues with the body.
struct ReplayBody {
    held: VecDeque<Result<Frame<Bytes>, BoxError>>,
    inner: crate::ResponseBody,
}

impl Body for ReplayBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(frame) = this.held.pop_front() {
            return Poll::Ready(Some(frame));
        }
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.held.is_empty() && self.inner.is_end_stream()
    }
}
