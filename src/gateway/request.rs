//! Buffered request and response types passed through the pipeline

use axum::{
    body::{Body, to_bytes},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::LengthLimitError;

use crate::{Error, Result};

/// Destination URL set by the outer routing layer
pub const FORWARDED_URL: &str = "x-cf-forwarded-url";
/// Opaque routing metadata set by the outer routing layer
pub const PROXY_METADATA: &str = "x-cf-proxy-metadata";
/// Signature over the routing metadata
pub const PROXY_SIGNATURE: &str = "x-cf-proxy-signature";

/// The three routing metadata headers, never forwarded upstream
pub const ROUTING_HEADERS: [&str; 3] = [FORWARDED_URL, PROXY_METADATA, PROXY_SIGNATURE];

/// Response headers re-derived by our own server
const HOP_BY_HOP_RESPONSE: [&str; 3] = ["connection", "transfer-encoding", "keep-alive"];

/// A request as received, fully buffered
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Request method
    pub method: Method,
    /// Request URI as seen by the gateway
    pub uri: Uri,
    /// Request headers
    pub headers: HeaderMap,
    /// Query parameters in order of appearance
    pub params: Vec<(String, String)>,
    /// Request body
    pub body: Bytes,
    /// Session id presented by the caller, if any
    pub session_id: Option<String>,
}

impl InboundRequest {
    /// Create a request without body or session
    #[must_use]
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let params = parse_query(uri.query());
        Self {
            method,
            uri,
            headers,
            params,
            body: Bytes::new(),
            session_id: None,
        }
    }

    /// Attach a body
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Buffer an axum request, reading the session id from `cookie_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body exceeds `max_body_size` or cannot be read.
    pub async fn from_request(
        request: Request<Body>,
        cookie_name: &str,
        max_body_size: usize,
    ) -> Result<Self> {
        let (parts, body) = request.into_parts();
        let body = to_bytes(body, max_body_size).await.map_err(body_error)?;

        let session_id = session_cookie(&parts.headers, cookie_name);
        let mut inbound = Self::new(parts.method, parts.uri, parts.headers).with_body(body);
        inbound.session_id = session_id;
        Ok(inbound)
    }

    /// First value of a query parameter
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Parameter names in order of first appearance
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        let mut seen = Vec::new();
        self.params.iter().filter_map(move |(k, _)| {
            if seen.contains(&k) {
                None
            } else {
                seen.push(k);
                Some(k.as_str())
            }
        })
    }

    /// Whether the outer routing layer marked this request for the gateway
    #[must_use]
    pub fn has_routing_metadata(&self) -> bool {
        has_routing_metadata(&self.headers)
    }
}

/// Tell an oversized body apart from one that broke while being read
fn body_error(error: axum::Error) -> Error {
    let too_large = std::iter::successors(
        Some(&error as &(dyn std::error::Error + 'static)),
        |e| e.source(),
    )
    .any(|e| e.is::<LengthLimitError>());

    if too_large {
        Error::PayloadTooLarge(error.to_string())
    } else {
        Error::InvalidRequest(format!("Failed to read request body: {error}"))
    }
}

/// `true` when at least one routing metadata header is present
#[must_use]
pub fn has_routing_metadata(headers: &HeaderMap) -> bool {
    ROUTING_HEADERS.iter().any(|name| headers.contains_key(*name))
}

/// Parse a query string into ordered pairs
#[must_use]
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Read a cookie value from the `Cookie` headers
#[must_use]
pub fn session_cookie(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

/// A fully buffered response, relayed to the caller as-is
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ProxyResponse {
    /// Create a response with no headers
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Drop headers that only describe the hop this response arrived on
    #[must_use]
    pub fn without_hop_by_hop(mut self) -> Self {
        for name in HOP_BY_HOP_RESPONSE {
            self.headers.remove(name);
        }
        self
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_params_keep_order_and_decode() {
        let uri: Uri = "/path?b=2&a=hello%20world&b=3".parse().unwrap();
        let req = InboundRequest::new(Method::GET, uri, HeaderMap::new());
        assert_eq!(req.parameter("a"), Some("hello world"));
        assert_eq!(req.parameter("b"), Some("2"));
        assert_eq!(req.parameter_names().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn test_session_cookie_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; GATEWAY_SESSION=abc-123"),
        );
        assert_eq!(
            session_cookie(&headers, "GATEWAY_SESSION").as_deref(),
            Some("abc-123")
        );
        assert!(session_cookie(&headers, "OTHER").is_none());
    }

    #[tokio::test]
    async fn test_oversized_body_is_payload_too_large() {
        let request = Request::post("/")
            .body(Body::from(vec![b'x'; 64]))
            .unwrap();
        let err = InboundRequest::from_request(request, "GATEWAY_SESSION", 16)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_broken_body_is_invalid_request() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"par")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ];
        let request = Request::post("/")
            .body(Body::from_stream(tokio_stream::iter(chunks)))
            .unwrap();
        let err = InboundRequest::from_request(request, "GATEWAY_SESSION", 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_body_within_limit_is_buffered() {
        let request = Request::post("/?a=1")
            .header(header::COOKIE, "GATEWAY_SESSION=s-1")
            .body(Body::from("payload"))
            .unwrap();
        let inbound = InboundRequest::from_request(request, "GATEWAY_SESSION", 1024)
            .await
            .unwrap();
        assert_eq!(inbound.body, "payload");
        assert_eq!(inbound.session_id.as_deref(), Some("s-1"));
        assert_eq!(inbound.parameter("a"), Some("1"));
    }

    #[test]
    fn test_any_routing_header_marks_request() {
        let mut headers = HeaderMap::new();
        assert!(!has_routing_metadata(&headers));
        headers.insert(PROXY_SIGNATURE, HeaderValue::from_static("S"));
        assert!(has_routing_metadata(&headers));
    }
}
