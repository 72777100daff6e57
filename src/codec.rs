use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderValue, StatusCode};
use http_body::{Body, Frame, SizeHint};
use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use pin_project::pin_project;
use tonic::{Code, Status};

use crate::util::base64::STANDARD;
use crate::BoxError;

const FRAME_HEADER_SIZE: usize = 5;

// 8th (MSB) bit of the 1st gRPC frame byte
// denotes an uncompressed trailer (as part of the body)
const GRPC_WEB_TRAILERS_BIT: u8 = 0b1000_0000;

pub(crate) const GRPC_STATUS: &str = "grpc-status";
pub(crate) const GRPC_MESSAGE: &str = "grpc-message";
pub(crate) const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";

pub(crate) mod content_types {
    use http::{header::CONTENT_TYPE, HeaderMap};

    pub(crate) const GRPC: &str = "application/grpc";
    pub(crate) const GRPC_PROTO: &str = "application/grpc+proto";
    pub(crate) const GRPC_WEB: &str = "application/grpc-web";
    pub(crate) const GRPC_WEB_TEXT: &str = "application/grpc-web-text";

    // A grpc-web content-type is anything starting with "application/grpc-web",
    // which covers the binary and -text forms with or without a
    // `+proto`/`+json` suffix.
    pub(crate) fn is_grpc_web(headers: &HeaderMap) -> bool {
        matches!(content_type(headers), Some(ct) if ct.starts_with(GRPC_WEB))
    }

    pub(crate) fn content_type(headers: &HeaderMap) -> Option<&str> {
        headers.get(CONTENT_TYPE).and_then(|val| val.to_str().ok())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Direction {
    Decode,
    Encode,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Encoding {
    Base64,
    None,
}

impl Encoding {
    pub(crate) fn from_content_type(headers: &HeaderMap) -> Encoding {
        match content_types::content_type(headers) {
            Some(ct) if ct.starts_with(content_types::GRPC_WEB_TEXT) => Encoding::Base64,
            _ => Encoding::None,
        }
    }
}

/// Rewrites a grpc-web content-type into the equivalent gRPC one, keeping
/// any `+proto`/`+json` suffix.
pub(crate) fn grpc_content_type(web: &str) -> HeaderValue {
    match web.split_once('+') {
        Some((_, suffix)) => HeaderValue::from_str(&format!("{}+{}", content_types::GRPC, suffix))
            .unwrap_or_else(|_| HeaderValue::from_static(content_types::GRPC)),
        None => HeaderValue::from_static(content_types::GRPC),
    }
}

/// HttpBody adapter for the grpc-web bridge.
///
/// In the `Decode` direction it turns a grpc-web request body into the raw
/// gRPC framing the wrapped handler reads. In the `Encode` direction it turns
/// the handler's response body into a grpc-web one: data frames pass through
/// and the gRPC trailers become the final in-body trailers frame. Text-mode
/// bodies are (de)coded as a single continuous base64 stream, carrying the
/// alignment remainder across chunks.
#[derive(Debug)]
#[pin_project]
pub(crate) struct WebCall<B> {
    #[pin]
    inner: B,
    buf: BytesMut,
    direction: Direction,
    encoding: Encoding,
    fallback_trailers: Option<HeaderMap>,
    trailers_done: bool,
}

impl<B> WebCall<B> {
    pub(crate) fn request(inner: B, encoding: Encoding) -> Self {
        Self::new(inner, Direction::Decode, encoding, None)
    }

    pub(crate) fn response(
        inner: B,
        encoding: Encoding,
        fallback_trailers: Option<HeaderMap>,
    ) -> Self {
        Self::new(inner, Direction::Encode, encoding, fallback_trailers)
    }

    fn new(
        inner: B,
        direction: Direction,
        encoding: Encoding,
        fallback_trailers: Option<HeaderMap>,
    ) -> Self {
        WebCall {
            inner,
            buf: BytesMut::new(),
            direction,
            encoding,
            fallback_trailers,
            trailers_done: false,
        }
    }
}

impl<B> WebCall<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    fn poll_decode(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        let mut this = self.project();

        match this.encoding {
            Encoding::Base64 => loop {
                if let Some(bytes) = decode_chunk(this.buf)? {
                    return Poll::Ready(Some(Ok(Frame::data(bytes))));
                }

                match ready!(this.inner.as_mut().poll_frame(cx)) {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            this.buf.extend_from_slice(&data);
                        }
                    }
                    Some(Err(e)) => return Poll::Ready(Some(Err(Status::from_error(e.into())))),
                    None => {
                        return if this.buf.is_empty() {
                            Poll::Ready(None)
                        } else {
                            Poll::Ready(Some(Err(internal_error("malformed base64 request"))))
                        }
                    }
                }
            },

            Encoding::None => match ready!(this.inner.poll_frame(cx)) {
                Some(Ok(frame)) => Poll::Ready(Some(Ok(frame))),
                Some(Err(e)) => Poll::Ready(Some(Err(Status::from_error(e.into())))),
                None => Poll::Ready(None),
            },
        }
    }

    fn poll_encode(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        let mut this = self.project();

        if *this.trailers_done {
            return Poll::Ready(None);
        }

        loop {
            match ready!(this.inner.as_mut().poll_frame(cx)) {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => {
                        let out = match this.encoding {
                            Encoding::None => data,
                            Encoding::Base64 => {
                                this.buf.extend_from_slice(&data);
                                let aligned = this.buf.len() / 3 * 3;
                                if aligned == 0 {
                                    continue;
                                }
                                Bytes::from(STANDARD.encode(this.buf.split_to(aligned)))
                            }
                        };
                        if out.is_empty() {
                            continue;
                        }
                        return Poll::Ready(Some(Ok(Frame::data(out))));
                    }
                    Err(frame) => {
                        let trailers = frame.into_trailers().unwrap_or_default();
                        *this.trailers_done = true;
                        let out = finish(this.buf, *this.encoding, Some(trailers), None);
                        return Poll::Ready(Some(Ok(Frame::data(out))));
                    }
                },
                Some(Err(e)) => return Poll::Ready(Some(Err(Status::from_error(e.into())))),
                None => {
                    *this.trailers_done = true;
                    let fallback = this.fallback_trailers.take();
                    let out = finish(this.buf, *this.encoding, None, fallback);
                    return Poll::Ready(Some(Ok(Frame::data(out))));
                }
            }
        }
    }
}

impl<B> Body for WebCall<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.direction {
            Direction::Decode => self.poll_decode(cx),
            Direction::Encode => self.poll_encode(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.direction {
            Direction::Decode => self.inner.is_end_stream() && self.buf.is_empty(),
            Direction::Encode => self.trailers_done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        // encoding changes the byte count, so never announce one
        SizeHint::default()
    }
}

// Split off the largest prefix whose length is a multiple of 4 and decode it,
// keeping the remainder buffered for the next chunk.
fn decode_chunk(buf: &mut BytesMut) -> Result<Option<Bytes>, Status> {
    let aligned = buf.len() / 4 * 4;
    if aligned == 0 {
        return Ok(None);
    }

    STANDARD
        .decode(buf.split_to(aligned))
        .map(|decoded| Some(Bytes::from(decoded)))
        .map_err(internal_error)
}

// The final bytes of every response: the one trailers frame, base64-flushed
// together with any carried remainder in text mode.
fn finish(
    buf: &mut BytesMut,
    encoding: Encoding,
    handler_trailers: Option<HeaderMap>,
    fallback_trailers: Option<HeaderMap>,
) -> Bytes {
    let mut trailers = handler_trailers.or(fallback_trailers).unwrap_or_default();
    ensure_grpc_status(&mut trailers);

    let frame = make_trailers_frame(&trailers);
    match encoding {
        Encoding::None => frame,
        Encoding::Base64 => {
            buf.extend_from_slice(&frame);
            let out = STANDARD.encode(&buf[..]);
            buf.clear();
            Bytes::from(out)
        }
    }
}

fn ensure_grpc_status(trailers: &mut HeaderMap) {
    if !trailers.contains_key(GRPC_STATUS) {
        trailers.insert(GRPC_STATUS, HeaderValue::from(Code::Unknown as i32));
        trailers.insert(GRPC_MESSAGE, percent_encode_message("internal error"));
    }
}

pub(crate) fn make_trailers_frame(trailers: &HeaderMap) -> Bytes {
    let encoded_len: usize = trailers
        .iter()
        .map(|(key, value)| {
            key.as_str().len()
                + 1  /* b':' */
                + value.as_bytes().len()
                + 2 /* b"\r\n" */
        })
        .sum();

    let mut frame = BytesMut::with_capacity(encoded_len + FRAME_HEADER_SIZE);
    frame.put_u8(GRPC_WEB_TRAILERS_BIT);
    frame.put_u32(encoded_len as u32);
    for (key, value) in trailers.iter() {
        frame.put_slice(key.as_ref());
        frame.put_u8(b':');
        frame.put_slice(value.as_bytes());
        frame.put_slice(b"\r\n");
    }
    frame.freeze()
}

/// Trailers extracted from a response that carried its gRPC status in the
/// headers instead of the body: either a trailers-only gRPC response, or a
/// plain HTTP failure from a handler that never reached the RPC layer.
pub(crate) fn take_trailers_fallback(
    headers: &mut HeaderMap,
    status: StatusCode,
) -> Option<HeaderMap> {
    let mut trailers = HeaderMap::new();
    for name in [GRPC_STATUS, GRPC_MESSAGE, GRPC_STATUS_DETAILS] {
        if let Some(value) = headers.remove(name) {
            trailers.insert(name, value);
        }
    }

    if !trailers.contains_key(GRPC_STATUS)
        && (status.is_client_error() || status.is_server_error())
    {
        trailers = failure_trailers(status);
    }

    if trailers.is_empty() {
        None
    } else {
        Some(trailers)
    }
}

fn failure_trailers(status: StatusCode) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert(GRPC_STATUS, HeaderValue::from(http_status_code(status) as i32));
    trailers.insert(
        GRPC_MESSAGE,
        percent_encode_message(status.canonical_reason().unwrap_or("internal error")),
    );
    trailers
}

fn http_status_code(status: StatusCode) -> Code {
    match status {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    }
}

// Characters outside 0x20..0x7e (plus '%' itself) are percent-encoded, the
// same scheme gRPC uses for status messages on the wire.
const GRPC_MESSAGE_SET: &AsciiSet = &CONTROLS.add(b'%');

fn percent_encode_message(msg: &str) -> HeaderValue {
    let encoded = percent_encode(msg.as_bytes(), GRPC_MESSAGE_SET).to_string();
    HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static("internal error"))
}

fn internal_error(e: impl std::fmt::Display) -> Status {
    Status::internal(e.to_string())
}
