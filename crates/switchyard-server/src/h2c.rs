//! HTTP/1.1 to cleartext HTTP/2 upgrade.
//!
//! A request carrying `Upgrade: h2c` and one valid `HTTP2-Settings` header
//! is answered with `101 Switching Protocols`, after which the connection
//! speaks HTTP/2. The upgrading request becomes stream 1 of that connection.
//!
//! [`UpgradedStream`] hands stream 1 to the HTTP/2 server as if the client
//! had sent it: it passes the client's connection preface and first SETTINGS
//! frame through, then replays the request as HEADERS (and DATA) frames
//! before any further client bytes. The request is then dispatched and
//! answered like every other stream, with the server's own flow control and
//! header compression.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Request, StatusCode, Version};
use hyper::body::Body;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{empty_body, HttpResponse};

/// Largest request body that is replayed on stream 1. Requests with a larger
/// or unknown body are served over HTTP/1.1 without upgrading.
pub const MAX_UPGRADE_BODY: usize = 16 * 1024;

/// `HTTP2-Settings` request header.
pub const HTTP2_SETTINGS: HeaderName = HeaderName::from_static("http2-settings");

const PREFACE_LEN: usize = 24;
const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_PAYLOAD: usize = 16_384;
const SETTING_LEN: usize = 6;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_CONTINUATION: u8 = 0x9;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const UPGRADED_STREAM_ID: u32 = 1;

const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::UPGRADE,
    header::TRANSFER_ENCODING,
    header::HOST,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
];

/// Whether `request` asks to switch its HTTP/1.1 connection to h2c.
pub fn is_upgrade_request<B: Body>(request: &Request<B>) -> bool {
    let headers = request.headers();
    request.version() == Version::HTTP_11
        && has_token(headers, &header::UPGRADE, "h2c")
        && has_token(headers, &header::CONNECTION, "http2-settings")
        && has_valid_settings(headers)
        && request
            .body()
            .size_hint()
            .upper()
            .is_some_and(|len| len <= MAX_UPGRADE_BODY as u64)
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Exactly one `HTTP2-Settings` value holding base64url SETTINGS entries.
fn has_valid_settings(headers: &HeaderMap) -> bool {
    let mut values = headers.get_all(HTTP2_SETTINGS).iter();
    let (Some(value), None) = (values.next(), values.next()) else {
        return false;
    };

    value
        .to_str()
        .ok()
        .and_then(|v| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .decode(v.trim().trim_end_matches('='))
                .ok()
        })
        .is_some_and(|payload| payload.len() % SETTING_LEN == 0)
}

/// The `101 Switching Protocols` answer to an upgrade request.
pub fn switching_protocols() -> HttpResponse {
    let mut response = HttpResponse::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
    response
}

/// Encodes the upgrading request as the HTTP/2 frames of stream 1.
///
/// Header fields are sent as HPACK literals without indexing, so the
/// server's decoder table is left exactly as the client's encoder expects.
/// Connection-specific fields are dropped; `Host` becomes `:authority`.
pub fn stream_one_frames(parts: &Parts, body: &[u8]) -> Bytes {
    let mut block = BytesMut::new();
    encode_field(&mut block, b":method", parts.method.as_str().as_bytes());
    encode_field(&mut block, b":scheme", b"http");
    let authority = parts
        .uri
        .authority()
        .map(|a| a.as_str().as_bytes())
        .or_else(|| parts.headers.get(header::HOST).map(HeaderValue::as_bytes));
    if let Some(authority) = authority {
        encode_field(&mut block, b":authority", authority);
    }
    let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
    encode_field(&mut block, b":path", path.as_bytes());

    let nominated: Vec<String> = parts
        .headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|item| item.trim().to_ascii_lowercase())
        .collect();

    for (name, value) in &parts.headers {
        if HOP_BY_HOP.contains(name)
            || *name == HTTP2_SETTINGS
            || nominated.iter().any(|n| n == name.as_str())
            || (*name == header::TE && value != "trailers")
        {
            continue;
        }
        encode_field(&mut block, name.as_str().as_bytes(), value.as_bytes());
    }

    let mut frames = BytesMut::new();
    let chunks: Vec<&[u8]> = block.chunks(MAX_FRAME_PAYLOAD).collect();
    let last = chunks.len().saturating_sub(1);
    for (index, chunk) in chunks.into_iter().enumerate() {
        let mut flags = 0;
        if index == 0 && body.is_empty() {
            flags |= FLAG_END_STREAM;
        }
        if index == last {
            flags |= FLAG_END_HEADERS;
        }
        let kind = if index == 0 { FRAME_HEADERS } else { FRAME_CONTINUATION };
        put_frame(&mut frames, kind, flags, chunk);
    }

    if !body.is_empty() {
        let chunks: Vec<&[u8]> = body.chunks(MAX_FRAME_PAYLOAD).collect();
        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let flags = if index == last { FLAG_END_STREAM } else { 0 };
            put_frame(&mut frames, FRAME_DATA, flags, chunk);
        }
    }

    frames.freeze()
}

/// Literal header field without indexing, new name (RFC 7541 §6.2.2).
fn encode_field(block: &mut BytesMut, name: &[u8], value: &[u8]) {
    block.put_u8(0x00);
    encode_string(block, name);
    encode_string(block, value);
}

#[allow(clippy::cast_possible_truncation)]
fn encode_string(block: &mut BytesMut, data: &[u8]) {
    // 7-bit prefix integer with the Huffman bit clear.
    let len = data.len();
    if len < 0x7f {
        block.put_u8(len as u8);
    } else {
        block.put_u8(0x7f);
        let mut rest = len - 0x7f;
        while rest >= 0x80 {
            block.put_u8((rest & 0x7f) as u8 | 0x80);
            rest >>= 7;
        }
        block.put_u8(rest as u8);
    }
    block.put_slice(data);
}

fn put_frame(out: &mut BytesMut, kind: u8, flags: u8, payload: &[u8]) {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    out.put_slice(&len.to_be_bytes()[1..]);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(UPGRADED_STREAM_ID);
    out.put_slice(payload);
}

/// Progress through the client's first bytes after the upgrade.
#[derive(Debug)]
enum Inbound {
    /// Bytes of the connection preface still to pass through.
    Preface(usize),
    /// The client's first SETTINGS frame header, as far as read.
    SettingsHeader {
        header: [u8; FRAME_HEADER_LEN],
        filled: usize,
    },
    /// Bytes of the SETTINGS payload still to pass through.
    SettingsPayload(usize),
    /// Stream 1 frames not yet handed to the reader.
    Replay(Bytes),
    Passthrough,
}

/// The upgraded connection as seen by the HTTP/2 server.
///
/// Writes pass straight through. Reads pass through too, except that the
/// stream 1 frames are inserted after the client's first SETTINGS frame.
#[derive(Debug)]
pub struct UpgradedStream<T> {
    io: T,
    inbound: Inbound,
    stream_one: Bytes,
}

impl<T> UpgradedStream<T> {
    /// Wraps the upgraded `io`, replaying `stream_one` once the client's
    /// preface has been read.
    pub fn new(io: T, stream_one: Bytes) -> Self {
        Self {
            io,
            inbound: Inbound::Preface(PREFACE_LEN),
            stream_one,
        }
    }

    /// Bytes to read before the next position of interest.
    fn expected(&self) -> usize {
        match &self.inbound {
            Inbound::Preface(left) | Inbound::SettingsPayload(left) => *left,
            Inbound::SettingsHeader { filled, .. } => FRAME_HEADER_LEN - filled,
            Inbound::Replay(_) | Inbound::Passthrough => usize::MAX,
        }
    }

    fn consume(&mut self, read: &[u8]) {
        let inbound = std::mem::replace(&mut self.inbound, Inbound::Passthrough);
        self.inbound = match inbound {
            Inbound::Preface(left) if read.len() < left => Inbound::Preface(left - read.len()),
            Inbound::Preface(_) => Inbound::SettingsHeader {
                header: [0; FRAME_HEADER_LEN],
                filled: 0,
            },
            Inbound::SettingsHeader { mut header, filled } => {
                let filled_now = filled + read.len();
                header[filled..filled_now].copy_from_slice(read);
                if filled_now < FRAME_HEADER_LEN {
                    Inbound::SettingsHeader {
                        header,
                        filled: filled_now,
                    }
                } else {
                    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
                    if len == 0 {
                        Inbound::Replay(std::mem::take(&mut self.stream_one))
                    } else {
                        Inbound::SettingsPayload(len)
                    }
                }
            }
            Inbound::SettingsPayload(left) if read.len() < left => {
                Inbound::SettingsPayload(left - read.len())
            }
            Inbound::SettingsPayload(_) => Inbound::Replay(std::mem::take(&mut self.stream_one)),
            other => other,
        };
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for UpgradedStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match &mut this.inbound {
            Inbound::Passthrough => return Pin::new(&mut this.io).poll_read(cx, buf),
            Inbound::Replay(frames) => {
                let n = frames.len().min(buf.remaining());
                buf.put_slice(&frames.split_to(n));
                if frames.is_empty() {
                    this.inbound = Inbound::Passthrough;
                }
                return Poll::Ready(Ok(()));
            }
            _ => {}
        }

        let mut scratch = [0u8; 1024];
        let limit = this.expected().min(buf.remaining()).min(scratch.len());
        let mut head = ReadBuf::new(&mut scratch[..limit]);
        ready!(Pin::new(&mut this.io).poll_read(cx, &mut head))?;

        let read = head.filled();
        buf.put_slice(read);
        this.consume(read);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for UpgradedStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}
