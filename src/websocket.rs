use std::future::poll_fn;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Version};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, Role};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tonic::{body::BoxBody, Status};
use tower_service::Service;
use tracing::{debug, trace};

use crate::codec::{content_types, take_trailers_fallback, Encoding, WebCall};
use crate::config::Config;
use crate::service::{endpoint_path, http_response};
use crate::{box_body, BoxError};

/// The sub-protocol token negotiated at upgrade.
pub(crate) const GRPC_WEBSOCKETS: &str = "grpc-websockets";

// Prefixes of client binary messages after the header block.
const PAYLOAD_PREFIX: u8 = 0;
const FINISH_SEND_PREFIX: u8 = 1;

const PIPE_CAPACITY: usize = 16;

pub(crate) fn is_websocket_request<B>(req: &Request<B>) -> bool {
    header_has_token(req.headers(), header::CONNECTION, "upgrade")
        && req
            .headers()
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        && header_has_token(req.headers(), header::SEC_WEBSOCKET_PROTOCOL, GRPC_WEBSOCKETS)
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

/// Answers a `grpc-websockets` upgrade: checks the origin, completes the
/// handshake, and spawns the task that tunnels one RPC over the socket.
pub(crate) fn upgrade<S, B>(inner: S, config: Config, mut req: Request<B>) -> Response<BoxBody>
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
{
    if !config.websocket_origin_allowed(req.headers()) {
        debug!(origin = ?req.headers().get(header::ORIGIN), "websocket origin rejected");
        return http_response(StatusCode::FORBIDDEN);
    }

    let accept_key = match req.headers().get(header::SEC_WEBSOCKET_KEY) {
        Some(key) => derive_accept_key(key.as_bytes()),
        None => {
            debug!("websocket upgrade without sec-websocket-key");
            return http_response(StatusCode::BAD_REQUEST);
        }
    };

    let path = endpoint_path(req.uri().path(), config.allow_non_root_resources).to_owned();
    let on_upgrade = hyper::upgrade::on(&mut req);

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                debug!(error = %e, "websocket upgrade failed");
                return;
            }
        };

        let socket =
            WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
        bridge_socket(socket, inner, path).await;
    });

    let mut res = http_response(StatusCode::SWITCHING_PROTOCOLS);
    let headers = res.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(GRPC_WEBSOCKETS),
    );
    if let Ok(accept) = HeaderValue::from_str(&accept_key) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    }
    res
}

/// Tunnels a single RPC over an accepted socket.
///
/// A reader task feeds client frames into the request body pipe while the
/// serving task streams the handler's frames back, both coordinated through
/// a cancellation token and a bounded outbound queue. The writer below is
/// the only place that touches the socket's send half, and it stops after
/// the first close frame, so the close is sent exactly once.
pub(crate) async fn bridge_socket<S, T>(socket: WebSocketStream<T>, inner: S, path: String)
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, stream) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(PIPE_CAPACITY);
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(PIPE_CAPACITY);
    let (headers_tx, headers_rx) = oneshot::channel::<HeaderMap>();
    let cancel = CancellationToken::new();

    let reader = tokio::spawn(read_socket(
        stream,
        headers_tx,
        body_tx,
        outbound_tx.clone(),
        cancel.clone(),
    ));

    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                result = serve_rpc(inner, path, headers_rx, body_rx, outbound_tx.clone()) => {
                    if let Err(e) = result {
                        debug!(error = %e, "websocket rpc failed");
                        let _ = outbound_tx.send(Message::Close(None)).await;
                    }
                }
                _ = cancel.cancelled() => {
                    trace!("websocket rpc cancelled");
                }
            }
        }
    });

    while let Some(message) = outbound_rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;

    cancel.cancel();
    server.abort();
    reader.abort();
}

// Socket-to-handler direction: the first binary message carries the request
// headers, every later one either a `0`-prefixed body chunk or the lone `1`
// half-close byte. Reading continues after the half-close so the peer's
// close frame still cancels an in-flight RPC.
//
// Framing violations queue the 1002 close while the header/body senders are
// still alive, so the serving task cannot slip its own close frame in first.
async fn read_socket<T>(
    mut stream: SplitStream<WebSocketStream<T>>,
    headers_tx: oneshot::Sender<HeaderMap>,
    body_tx: mpsc::Sender<Bytes>,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut headers_tx = Some(headers_tx);
    let mut body_tx = Some(body_tx);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if let Some(tx) = headers_tx.take() {
                    match parse_headers_block(&data) {
                        Ok(headers) => {
                            let _ = tx.send(headers);
                        }
                        Err(e) => {
                            debug!(error = %e, "malformed websocket header block");
                            protocol_close(&outbound).await;
                            break;
                        }
                    }
                    continue;
                }

                match data.split_first() {
                    Some((&PAYLOAD_PREFIX, payload)) => {
                        if let Some(tx) = &body_tx {
                            if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some((&FINISH_SEND_PREFIX, _)) => {
                        // half-close: the request body ends, the RPC goes on
                        body_tx = None;
                    }
                    _ => {
                        debug!("unexpected websocket message prefix");
                        protocol_close(&outbound).await;
                        break;
                    }
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Ok(_) => {
                debug!("non-binary websocket message");
                protocol_close(&outbound).await;
                break;
            }
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        }
    }

    cancel.cancel();
}

async fn protocol_close(outbound: &mpsc::Sender<Message>) {
    let frame = CloseFrame {
        code: CloseCode::Protocol,
        reason: "malformed grpc-websockets frame".into(),
    };
    let _ = outbound.send(Message::Close(Some(frame))).await;
}

// Handler-to-socket direction: every frame the response encoder yields (data
// frames as produced, then the one trailers frame) becomes one binary
// message, followed by a clean close.
async fn serve_rpc<S>(
    mut inner: S,
    path: String,
    headers_rx: oneshot::Receiver<HeaderMap>,
    body_rx: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Message>,
) -> Result<(), BoxError>
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>>,
    S::Error: Into<BoxError>,
{
    let headers = headers_rx
        .await
        .map_err(|_| "websocket closed before the header block")?;

    let body = StreamBody::new(
        ReceiverStream::new(body_rx).map(|data| Ok::<_, Status>(Frame::data(data))),
    );

    let mut req = Request::builder()
        .method(Method::POST)
        .uri(path.as_str())
        .version(Version::HTTP_2)
        .body(box_body(body))?;

    *req.headers_mut() = headers;
    req.headers_mut().remove(header::CONTENT_LENGTH);
    req.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_types::GRPC_PROTO),
    );
    req.headers_mut()
        .insert(header::TE, HeaderValue::from_static("trailers"));

    poll_fn(|cx| inner.poll_ready(cx)).await.map_err(Into::into)?;
    let res = inner.call(req).await.map_err(Into::into)?;

    let (mut parts, body) = res.into_parts();
    let fallback = take_trailers_fallback(&mut parts.headers, parts.status);

    let mut body = WebCall::response(body, Encoding::None, fallback);
    while let Some(frame) = body.frame().await {
        if let Ok(data) = frame?.into_data() {
            outbound
                .send(Message::Binary(data.to_vec()))
                .await
                .map_err(|_| "websocket writer gone")?;
        }
    }

    outbound.send(Message::Close(None)).await.ok();
    Ok(())
}

fn parse_headers_block(data: &[u8]) -> Result<HeaderMap, BoxError> {
    let text = std::str::from_utf8(data)?;

    let mut headers = HeaderMap::new();
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let (name, value) = line.split_once(':').ok_or("header line without a colon")?;
        headers.append(
            HeaderName::try_from(name.trim())?,
            HeaderValue::try_from(value.trim())?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::BoxFuture;
    use std::future::Future;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use std::time::Duration;

    #[derive(Clone)]
    struct Svc<F>(F);

    impl<F, Fut> Service<Request<BoxBody>> for Svc<F>
    where
        F: FnMut(Request<BoxBody>) -> Fut,
        Fut: Future<Output = Result<Response<BoxBody>, String>> + Send + 'static,
    {
        type Response = Response<BoxBody>;
        type Error = String;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<BoxBody>) -> Self::Future {
            Box::pin((self.0)(req))
        }
    }

    fn frame_body(frames: Vec<Frame<Bytes>>) -> BoxBody {
        box_body(StreamBody::new(tokio_stream::iter(
            frames.into_iter().map(Ok::<_, Status>),
        )))
    }

    fn upgrade_request() -> Request<BoxBody> {
        Request::builder()
            .method(Method::GET)
            .uri("/svc.Svc/Echo")
            .header(header::HOST, "app.example")
            .header(header::ORIGIN, "http://app.example")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(header::SEC_WEBSOCKET_PROTOCOL, "grpc-websockets")
            .body(crate::empty_body())
            .unwrap()
    }

    mod classifier {
        use super::*;

        #[test]
        fn accepts_a_grpc_websockets_upgrade() {
            assert!(is_websocket_request(&upgrade_request()));
        }

        #[test]
        fn requires_the_sub_protocol() {
            let mut req = upgrade_request();
            req.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static("chat"),
            );
            assert!(!is_websocket_request(&req));
        }

        #[test]
        fn requires_the_upgrade_headers() {
            let mut req = upgrade_request();
            req.headers_mut().remove(header::UPGRADE);
            assert!(!is_websocket_request(&req));

            let mut req = upgrade_request();
            req.headers_mut()
                .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            assert!(!is_websocket_request(&req));
        }
    }

    mod handshake {
        use super::*;

        fn noop_svc() -> Svc<impl Clone + FnMut(Request<BoxBody>) -> BoxFuture<Response<BoxBody>, String>>
        {
            Svc(|_req: Request<BoxBody>| -> BoxFuture<Response<BoxBody>, String> {
                Box::pin(async { Ok(Response::new(crate::empty_body())) })
            })
        }

        #[tokio::test]
        async fn switching_protocols_with_the_accept_key() {
            let res = upgrade(noop_svc(), Config::default(), upgrade_request());

            assert_eq!(res.status(), StatusCode::SWITCHING_PROTOCOLS);
            assert_eq!(res.headers()[header::UPGRADE], "websocket");
            assert_eq!(res.headers()[header::SEC_WEBSOCKET_PROTOCOL], "grpc-websockets");
            // RFC 6455 sample key
            assert_eq!(
                res.headers()[header::SEC_WEBSOCKET_ACCEPT],
                "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
            );
        }

        #[tokio::test]
        async fn foreign_origin_is_rejected() {
            let mut req = upgrade_request();
            req.headers_mut()
                .insert(header::ORIGIN, HeaderValue::from_static("http://evil.example"));

            let res = upgrade(noop_svc(), Config::default(), req);

            assert_eq!(res.status(), StatusCode::FORBIDDEN);
        }

        #[tokio::test]
        async fn missing_key_is_a_bad_request() {
            let mut req = upgrade_request();
            req.headers_mut().remove(header::SEC_WEBSOCKET_KEY);

            let res = upgrade(noop_svc(), Config::default(), req);

            assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn parses_a_header_block() {
        let block = b"content-type: application/grpc-web+proto\r\nx-token: abc\r\n\r\n";
        let headers = parse_headers_block(block).unwrap();

        assert_eq!(headers["content-type"], "application/grpc-web+proto");
        assert_eq!(headers["x-token"], "abc");
    }

    #[test]
    fn rejects_a_malformed_header_block() {
        assert!(parse_headers_block(b"no colon here\r\n\r\n").is_err());
        assert!(parse_headers_block(&[0xff, 0xfe]).is_err());
    }

    mod bridge {
        use super::*;

        type Seen = Arc<Mutex<Option<(HeaderMap, Bytes)>>>;

        async fn client_socket(
        ) -> (WebSocketStream<tokio::io::DuplexStream>, tokio::task::JoinHandle<()>, Seen)
        {
            let (client_io, server_io) = tokio::io::duplex(4096);

            let seen: Seen = Arc::new(Mutex::new(None));
            let capture = seen.clone();
            let svc = Svc(move |req: Request<BoxBody>| -> BoxFuture<Response<BoxBody>, String> {
                let capture = capture.clone();
                Box::pin(async move {
                    let headers = req.headers().clone();
                    let body = req.into_body().collect().await.unwrap().to_bytes();
                    *capture.lock().unwrap() = Some((headers, body));

                    let mut trailers = HeaderMap::new();
                    trailers.insert("grpc-status", HeaderValue::from_static("0"));
                    Ok(Response::new(frame_body(vec![
                        Frame::data(Bytes::from_static(b"\x00\x00\x00\x00\x01\x0a")),
                        Frame::data(Bytes::from_static(b"\x00\x00\x00\x00\x01\x0b")),
                        Frame::trailers(trailers),
                    ])))
                })
            });

            let bridge = tokio::spawn(async move {
                let socket =
                    WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
                bridge_socket(socket, svc, "/svc.Svc/Echo".to_owned()).await;
            });

            let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
            (client, bridge, seen)
        }

        #[tokio::test]
        async fn tunnels_one_rpc() {
            let (mut client, bridge, seen) = client_socket().await;

            client
                .send(Message::Binary(
                    b"content-type: application/grpc-web+proto\r\nx-token: abc\r\n\r\n".to_vec(),
                ))
                .await
                .unwrap();

            let mut payload = vec![PAYLOAD_PREFIX];
            payload.extend_from_slice(b"\x00\x00\x00\x00\x02\x01\x02");
            client.send(Message::Binary(payload)).await.unwrap();
            client
                .send(Message::Binary(vec![FINISH_SEND_PREFIX]))
                .await
                .unwrap();

            let first = client.next().await.unwrap().unwrap();
            assert_eq!(
                first,
                Message::Binary(b"\x00\x00\x00\x00\x01\x0a".to_vec())
            );

            let second = client.next().await.unwrap().unwrap();
            assert_eq!(
                second,
                Message::Binary(b"\x00\x00\x00\x00\x01\x0b".to_vec())
            );

            let trailers = match client.next().await.unwrap().unwrap() {
                Message::Binary(data) => data,
                other => panic!("expected a trailers message, got {other:?}"),
            };
            assert_eq!(&trailers[..], b"\x80\x00\x00\x00\x0fgrpc-status:0\r\n");

            assert!(matches!(
                client.next().await.unwrap().unwrap(),
                Message::Close(_)
            ));

            bridge.await.unwrap();

            let (headers, body) = seen.lock().unwrap().take().unwrap();
            assert_eq!(headers[header::CONTENT_TYPE], "application/grpc+proto");
            assert_eq!(headers["x-token"], "abc");
            assert_eq!(&body[..], b"\x00\x00\x00\x00\x02\x01\x02");
        }

        #[tokio::test]
        async fn framing_violation_closes_with_protocol_error() {
            let (mut client, bridge, _seen) = client_socket().await;

            client
                .send(Message::Binary(b"no colon here\r\n\r\n".to_vec()))
                .await
                .unwrap();

            match client.next().await.unwrap().unwrap() {
                Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Protocol),
                other => panic!("expected a protocol-error close, got {other:?}"),
            }

            bridge.await.unwrap();
        }

        #[tokio::test]
        async fn peer_close_cancels_the_rpc() {
            let (mut client, bridge, _seen) = client_socket().await;

            client
                .send(Message::Binary(
                    b"content-type: application/grpc-web+proto\r\n\r\n".to_vec(),
                ))
                .await
                .unwrap();
            client.close(None).await.unwrap();
            drop(client);

            tokio::time::timeout(Duration::from_secs(5), bridge)
                .await
                .expect("bridge task should finish after the peer closes")
                .unwrap();
        }
    }
}
