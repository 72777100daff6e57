use std::sync::Arc;
use std::time::Duration;

use http::{header::HeaderName, HeaderMap, HeaderValue};

use self::headers::*;
use crate::config::Config;

pub(crate) mod headers {
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS as ALLOW_CREDENTIALS;
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_HEADERS as ALLOW_HEADERS;
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_METHODS as ALLOW_METHODS;
    pub(crate) use http::header::ACCESS_CONTROL_ALLOW_ORIGIN as ALLOW_ORIGIN;
    pub(crate) use http::header::ACCESS_CONTROL_MAX_AGE as MAX_AGE;
    pub(crate) use http::header::ORIGIN;
}

// Ten minutes, to damp preflight storms without pinning a stale policy in
// browser caches for a whole day.
const PREFLIGHT_MAX_AGE: Duration = Duration::from_secs(600);

const DEFAULT_ALLOW_HEADERS: [&str; 4] =
    ["x-grpc-web", "content-type", "x-user-agent", "grpc-timeout"];

// Headers the bridge itself understands, always permitted.
const BRIDGE_ALLOW_HEADERS: [&str; 1] = ["u-a"];

/// The CORS gate for grpc-web traffic.
///
/// Preflights are answered without consulting the wrapped service. Actual
/// grpc-web responses get the allow-origin and allow-credentials headers
/// attached. No expose-headers list is ever sent: the response interceptor
/// rewrites responses and must not be constrained by one.
#[derive(Debug, Clone)]
pub(crate) struct Cors {
    cache: Arc<Cache>,
}

#[derive(Debug)]
struct Cache {
    config: Config,
    allow_headers: HeaderValue,
    allow_methods: HeaderValue,
    allow_credentials: HeaderValue,
    max_age: HeaderValue,
}

impl Cors {
    pub(crate) fn new(config: &Config) -> Cors {
        let mut names: Vec<HeaderName> = config.allowed_request_headers.clone();
        for header in BRIDGE_ALLOW_HEADERS.iter().chain(&DEFAULT_ALLOW_HEADERS) {
            let name = HeaderName::from_static(header);
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let allow_headers = join_header_value(names.iter().map(HeaderName::as_str)).unwrap();

        let cache = Arc::new(Cache {
            config: config.clone(),
            allow_headers,
            allow_methods: HeaderValue::from_static("POST"),
            allow_credentials: HeaderValue::from_static("true"),
            max_age: HeaderValue::from(PREFLIGHT_MAX_AGE.as_secs()),
        });

        Cors { cache }
    }

    /// Response headers for an acceptable preflight, or `None` when the
    /// origin is missing or not admitted (the response then carries no CORS
    /// headers at all and the browser aborts the call).
    pub(crate) fn preflight(&self, request_headers: &HeaderMap) -> Option<HeaderMap> {
        let origin = request_headers.get(ORIGIN)?;
        if !self.is_origin_allowed(origin) {
            return None;
        }

        let mut headers = self.common_headers(origin.clone());
        headers.insert(ALLOW_METHODS, self.cache.allow_methods.clone());
        headers.insert(ALLOW_HEADERS, self.cache.allow_headers.clone());
        headers.insert(MAX_AGE, self.cache.max_age.clone());
        Some(headers)
    }

    /// Headers to attach to an actual grpc-web response. Empty when there is
    /// no origin to echo or it is not admitted.
    pub(crate) fn simple(&self, request_headers: &HeaderMap) -> HeaderMap {
        match request_headers.get(ORIGIN) {
            Some(origin) if self.is_origin_allowed(origin) => self.common_headers(origin.clone()),
            _ => HeaderMap::new(),
        }
    }

    fn common_headers(&self, origin: HeaderValue) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ALLOW_ORIGIN, origin);
        headers.insert(ALLOW_CREDENTIALS, self.cache.allow_credentials.clone());
        headers
    }

    fn is_origin_allowed(&self, origin: &HeaderValue) -> bool {
        origin
            .to_str()
            .map(|origin| self.cache.config.origin_allowed(origin))
            .unwrap_or(false)
    }
}

fn join_header_value<I>(values: I) -> Result<HeaderValue, http::header::InvalidHeaderValue>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut values = values.into_iter();
    let mut value = Vec::new();

    if let Some(v) = values.next() {
        value.extend(v.as_ref().as_bytes());
    }
    for v in values {
        value.push(b',');
        value.extend(v.as_ref().as_bytes());
    }
    HeaderValue::from_bytes(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> HeaderValue {
        s.parse().unwrap()
    }

    fn preflight_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN, value("http://example.com"));
        headers
    }

    fn sorted(value: &str) -> Vec<&str> {
        let mut vec = value.split(',').collect::<Vec<_>>();
        vec.sort_unstable();
        vec
    }

    mod preflight {
        use super::*;

        #[test]
        fn default_config() {
            let cors = Cors::new(&Config::default());
            let headers = cors.preflight(&preflight_headers()).unwrap();

            assert_eq!(headers[ALLOW_ORIGIN], "http://example.com");
            assert_eq!(headers[ALLOW_METHODS], "POST");
            assert_eq!(headers[ALLOW_CREDENTIALS], "true");
            assert_eq!(headers[MAX_AGE], "600");
            assert_eq!(
                sorted(headers[ALLOW_HEADERS].to_str().unwrap()),
                sorted("u-a,x-grpc-web,content-type,x-user-agent,grpc-timeout")
            );
        }

        #[test]
        fn origin_predicate() {
            let cors = Cors::new(
                &Config::default().allow_origin(|origin| origin == "http://example.com"),
            );

            assert!(cors.preflight(&preflight_headers()).is_some());

            let mut denied = preflight_headers();
            denied.insert(ORIGIN, value("http://evil.example"));
            assert!(cors.preflight(&denied).is_none());
        }

        #[test]
        fn missing_origin_is_denied() {
            let cors = Cors::new(&Config::default());
            assert!(cors.preflight(&HeaderMap::new()).is_none());
        }

        #[test]
        fn caller_headers_are_merged() {
            let cors = Cors::new(
                &Config::default().allow_request_headers(["x-request-id", "authorization"]),
            );
            let headers = cors.preflight(&preflight_headers()).unwrap();

            let allowed = headers[ALLOW_HEADERS].to_str().unwrap();
            assert!(allowed.contains("x-request-id"), "{allowed}");
            assert!(allowed.contains("authorization"), "{allowed}");
            assert!(allowed.contains("x-grpc-web"), "{allowed}");
        }

        #[test]
        fn duplicate_caller_headers_appear_once() {
            let cors = Cors::new(&Config::default().allow_request_headers(["x-grpc-web"]));
            let headers = cors.preflight(&preflight_headers()).unwrap();

            let allowed = headers[ALLOW_HEADERS].to_str().unwrap();
            assert_eq!(allowed.matches("x-grpc-web").count(), 1, "{allowed}");
        }
    }

    mod simple {
        use super::*;

        #[test]
        fn echoes_the_origin() {
            let cors = Cors::new(&Config::default());
            let headers = cors.simple(&preflight_headers());

            assert_eq!(headers[ALLOW_ORIGIN], "http://example.com");
            assert_eq!(headers[ALLOW_CREDENTIALS], "true");
            assert!(!headers.contains_key(ALLOW_HEADERS));
            assert!(!headers.contains_key(ALLOW_METHODS));
            assert!(!headers.contains_key(MAX_AGE));
        }

        #[test]
        fn no_origin_no_headers() {
            let cors = Cors::new(&Config::default());
            assert!(cors.simple(&HeaderMap::new()).is_empty());
        }

        #[test]
        fn denied_origin_no_headers() {
            let cors = Cors::new(&Config::default().allow_origin(|_| false));
            assert!(cors.simple(&preflight_headers()).is_empty());
        }
    }
}
