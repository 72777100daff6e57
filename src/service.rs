use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body::Body;
use tonic::{body::BoxBody, server::NamedService};
use tower_service::Service;
use tracing::{debug, trace};

use crate::codec::{self, content_types, Encoding, WebCall};
use crate::config::Config;
use crate::cors::Cors;
use crate::websocket;
use crate::{empty_body, BoxError};

pub(crate) type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// Service implementing the grpc-web bridge.
///
/// Wraps an inner gRPC service and translates grpc-web requests into the
/// gRPC-over-HTTP/2 form the inner service expects, answering the related
/// CORS preflights itself. Requests that are neither grpc-web, an acceptable
/// preflight, nor a `grpc-websockets` upgrade are forwarded untouched.
#[derive(Debug, Clone)]
pub struct GrpcWebBridge<S> {
    inner: S,
    config: Config,
    cors: Cors,
}

#[derive(Debug, PartialEq)]
enum RequestKind {
    GrpcWeb { encoding: Encoding },
    Preflight,
    Websocket,
    Other,
}

impl<S> GrpcWebBridge<S> {
    pub(crate) fn new(inner: S, config: Config) -> Self {
        let cors = Cors::new(&config);
        GrpcWebBridge {
            inner,
            config,
            cors,
        }
    }

    fn classify<B>(&self, req: &Request<B>) -> RequestKind {
        if self.config.enable_websockets && websocket::is_websocket_request(req) {
            return RequestKind::Websocket;
        }

        if is_grpc_web_request(req) {
            return RequestKind::GrpcWeb {
                encoding: Encoding::from_content_type(req.headers()),
            };
        }

        if self.is_acceptable_grpc_cors_preflight(req) {
            return RequestKind::Preflight;
        }

        RequestKind::Other
    }

    // An OPTIONS request is handled by the bridge only when the browser
    // announces the `x-grpc-web` request header and, under endpoint gating,
    // the path names a registered RPC. Anything else falls through to the
    // wrapped service.
    fn is_acceptable_grpc_cors_preflight<B>(&self, req: &Request<B>) -> bool {
        if req.method() != Method::OPTIONS || !announces_grpc_web(req.headers()) {
            return false;
        }

        if !self.config.cors_for_registered_endpoints_only {
            return true;
        }

        let endpoint = endpoint_path(req.uri().path(), self.config.allow_non_root_resources);
        self.config.endpoint_registered(endpoint)
    }
}

impl<S, B> Service<Request<B>> for GrpcWebBridge<S>
where
    S: Service<Request<BoxBody>, Response = Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    type Response = Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        match self.classify(&req) {
            RequestKind::Websocket => {
                trace!(kind = "websocket", path = ?req.uri().path());

                let res = websocket::upgrade(self.inner.clone(), self.config.clone(), req);
                Box::pin(async move { Ok(res) })
            }

            RequestKind::GrpcWeb { encoding } => {
                trace!(kind = "grpc-web", path = ?req.uri().path(), ?encoding);

                let cors_headers = self.cors.simple(req.headers());
                let content_type = req
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .cloned()
                    .unwrap_or_else(|| HeaderValue::from_static(content_types::GRPC_WEB));

                let fut = self
                    .inner
                    .call(coerce_request(req, encoding, &self.config));

                Box::pin(async move {
                    let mut res = coerce_response(fut.await?, encoding, content_type);
                    res.headers_mut().extend(cors_headers);
                    Ok(res)
                })
            }

            RequestKind::Preflight => {
                trace!(kind = "preflight", path = ?req.uri().path());

                let mut res = http_response(StatusCode::NO_CONTENT);
                match self.cors.preflight(req.headers()) {
                    Some(headers) => res.headers_mut().extend(headers),
                    None => debug!(kind = "preflight", error = "origin not allowed"),
                }
                Box::pin(async move { Ok(res) })
            }

            RequestKind::Other => {
                debug!(kind = "other", content_type = ?req.headers().get(header::CONTENT_TYPE));

                Box::pin(self.inner.call(req.map(crate::box_body)))
            }
        }
    }
}

pub(crate) fn http_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .unwrap()
}

pub(crate) fn is_grpc_web_request<B>(req: &Request<B>) -> bool {
    req.method() == Method::POST && content_types::is_grpc_web(req.headers())
}

fn announces_grpc_web(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCESS_CONTROL_REQUEST_HEADERS)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("x-grpc-web"))
}

/// The gRPC endpoint named by a request path. With `allow_non_root` set,
/// this is the last `/<service>/<method>` suffix whose service segment
/// contains a dot, so services mounted beneath a prefix still resolve.
pub(crate) fn endpoint_path(path: &str, allow_non_root: bool) -> &str {
    if allow_non_root {
        rooted_endpoint(path).unwrap_or(path)
    } else {
        path
    }
}

fn rooted_endpoint(path: &str) -> Option<&str> {
    let (prefix, method) = path.rsplit_once('/')?;
    let service = prefix.rsplit('/').next()?;

    if service.contains('.') && !method.is_empty() {
        Some(&path[prefix.len() - service.len() - 1..])
    } else {
        None
    }
}

fn coerce_request<B>(mut req: Request<B>, encoding: Encoding, config: &Config) -> Request<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let content_type = content_types::content_type(req.headers())
        .map(codec::grpc_content_type)
        .unwrap_or_else(|| HeaderValue::from_static(content_types::GRPC));

    *req.version_mut() = Version::HTTP_2;

    req.headers_mut().remove(header::CONTENT_LENGTH);
    req.headers_mut().insert(header::CONTENT_TYPE, content_type);
    req.headers_mut()
        .insert(header::TE, HeaderValue::from_static("trailers"));
    req.headers_mut().insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static("identity,deflate,gzip"),
    );

    if config.allow_non_root_resources {
        if let Some(uri) = rewrite_to_endpoint(req.uri()) {
            *req.uri_mut() = uri;
        }
    }

    req.map(|b| crate::box_body(WebCall::request(b, encoding)))
}

fn rewrite_to_endpoint(uri: &Uri) -> Option<Uri> {
    let path = uri.path();
    let endpoint = rooted_endpoint(path)?;
    if endpoint.len() == path.len() {
        return None;
    }

    let path_and_query = match uri.query() {
        Some(query) => PathAndQuery::try_from(format!("{endpoint}?{query}")).ok()?,
        None => PathAndQuery::try_from(endpoint).ok()?,
    };

    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).ok()
}

fn coerce_response(
    res: Response<BoxBody>,
    encoding: Encoding,
    content_type: HeaderValue,
) -> Response<BoxBody> {
    let (mut parts, body) = res.into_parts();

    let fallback = codec::take_trailers_fallback(&mut parts.headers, parts.status);

    // RPC failures ride in the trailers frame; the HTTP status stays 200.
    parts.status = StatusCode::OK;
    parts.headers.remove(header::TRAILER);
    parts.headers.insert(header::CONTENT_TYPE, content_type);

    Response::from_parts(
        parts,
        crate::box_body(WebCall::response(body, encoding, fallback)),
    )
}

impl<S: NamedService> NamedService for GrpcWebBridge<S> {
    const NAME: &'static str = S::NAME;
}
