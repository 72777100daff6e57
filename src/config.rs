use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use http::{header, HeaderMap, HeaderName, Uri};

use crate::GrpcWebBridge;

type OriginPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type WebsocketOriginPredicate = Arc<dyn Fn(&HeaderMap) -> bool + Send + Sync>;
type EndpointsFn = Arc<dyn Fn() -> HashSet<String> + Send + Sync>;

/// A configuration builder for the grpc-web bridge.
///
/// `Config` controls the CORS gate and the optional websocket transport.
/// Since the bridge serves grpc-web compliant browser clients, some CORS
/// values are fixed by the protocol and not configurable: the allowed
/// methods are `POST` and `OPTIONS`, credentials are always allowed (which
/// is why the allowed origin is echoed rather than wildcarded), and no
/// expose-headers list is sent.
///
/// ## Defaults
///
/// * every origin is allowed
/// * preflights are answered for any path
/// * websockets are disabled; when enabled, upgrades are accepted only from
///   the page's own host unless [`Config::websocket_origin`] is set
#[derive(Clone)]
pub struct Config {
    pub(crate) origin_predicate: Option<OriginPredicate>,
    pub(crate) allowed_request_headers: Vec<HeaderName>,
    pub(crate) cors_for_registered_endpoints_only: bool,
    pub(crate) endpoints: Option<EndpointsFn>,
    pub(crate) allow_non_root_resources: bool,
    pub(crate) enable_websockets: bool,
    pub(crate) websocket_origin_predicate: Option<WebsocketOriginPredicate>,
}

impl Config {
    pub(crate) fn new() -> Config {
        Config {
            origin_predicate: None,
            allowed_request_headers: Vec::new(),
            cors_for_registered_endpoints_only: false,
            endpoints: None,
            allow_non_root_resources: false,
            enable_websockets: false,
            websocket_origin_predicate: None,
        }
    }

    /// Only allow origins admitted by the given predicate.
    ///
    /// The predicate receives the value of the `origin` header. All origins
    /// are allowed by default.
    ///
    /// ## Example
    ///
    /// ```
    /// grpc_web_bridge::config().allow_origin(|origin| origin.ends_with(".example.com"));
    /// ```
    pub fn allow_origin<F>(mut self, predicate: F) -> Config
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.origin_predicate = Some(Arc::new(predicate));
        self
    }

    /// Adds headers to the list the CORS gate permits clients to send,
    /// on top of the standard grpc-web set.
    pub fn allow_request_headers<I>(mut self, headers: I) -> Config
    where
        I: IntoIterator,
        HeaderName: TryFrom<I::Item>,
    {
        let iter = headers
            .into_iter()
            .map(|header| match TryFrom::try_from(header) {
                Ok(header) => header,
                Err(_) => panic!("invalid header name"),
            });

        self.allowed_request_headers.extend(iter);
        self
    }

    /// If true, preflights are answered only for endpoints reported by the
    /// [`Config::endpoints`] function; preflights for anything else fall
    /// through to the wrapped service.
    ///
    /// With no endpoints function configured this rejects every preflight.
    pub fn cors_for_registered_endpoints_only(mut self, value: bool) -> Config {
        self.cors_for_registered_endpoints_only = value;
        self
    }

    /// Supplies the set of registered `/<service>/<method>` endpoint paths.
    ///
    /// The function is consulted on each preflight, so a changing set is
    /// picked up without rebuilding the bridge.
    pub fn endpoints<F>(mut self, endpoints: F) -> Config
    where
        F: Fn() -> HashSet<String> + Send + Sync + 'static,
    {
        self.endpoints = Some(Arc::new(endpoints));
        self
    }

    /// If true, the gRPC endpoint is extracted from the tail of the request
    /// path, so the bridge can be mounted beneath a prefix. Otherwise the
    /// full path is handed to the wrapped service unchanged.
    pub fn allow_non_root_resources(mut self, value: bool) -> Config {
        self.allow_non_root_resources = value;
        self
    }

    /// Enables the `grpc-websockets` transport, which tunnels one RPC per
    /// socket and supports client- and bidirectional-streaming calls.
    pub fn enable_websockets(mut self, value: bool) -> Config {
        self.enable_websockets = value;
        self
    }

    /// Only accept websocket upgrades whose headers are admitted by the
    /// given predicate.
    ///
    /// The default accepts an upgrade when the `origin` header's authority
    /// equals the `host` header.
    pub fn websocket_origin<F>(mut self, predicate: F) -> Config
    where
        F: Fn(&HeaderMap) -> bool + Send + Sync + 'static,
    {
        self.websocket_origin_predicate = Some(Arc::new(predicate));
        self
    }

    /// Enable a service to handle grpc-web requests with this configuration.
    pub fn enable<S>(&self, service: S) -> GrpcWebBridge<S> {
        GrpcWebBridge::new(service, self.clone())
    }

    pub(crate) fn origin_allowed(&self, origin: &str) -> bool {
        match &self.origin_predicate {
            Some(predicate) => predicate(origin),
            None => true,
        }
    }

    pub(crate) fn endpoint_registered(&self, endpoint: &str) -> bool {
        match &self.endpoints {
            Some(endpoints) => endpoints().contains(endpoint),
            None => false,
        }
    }

    pub(crate) fn websocket_origin_allowed(&self, headers: &HeaderMap) -> bool {
        match &self.websocket_origin_predicate {
            Some(predicate) => predicate(headers),
            None => same_origin(headers),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field(
                "origin_predicate",
                &self.origin_predicate.as_ref().map(|_| ".."),
            )
            .field("allowed_request_headers", &self.allowed_request_headers)
            .field(
                "cors_for_registered_endpoints_only",
                &self.cors_for_registered_endpoints_only,
            )
            .field("endpoints", &self.endpoints.as_ref().map(|_| ".."))
            .field("allow_non_root_resources", &self.allow_non_root_resources)
            .field("enable_websockets", &self.enable_websockets)
            .field(
                "websocket_origin_predicate",
                &self.websocket_origin_predicate.as_ref().map(|_| ".."),
            )
            .finish()
    }
}

fn same_origin(headers: &HeaderMap) -> bool {
    let host = match headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        Some(host) => host,
        None => return false,
    };

    let origin = match headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        Some(origin) => origin,
        None => return false,
    };

    match origin.parse::<Uri>() {
        Ok(uri) => uri
            .authority()
            .map(|authority| authority.as_str().eq_ignore_ascii_case(host))
            .unwrap_or(false),
        Err(_) => false,
    }
}
