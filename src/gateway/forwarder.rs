//! Outbound request reconstruction and dispatch

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, Method};
use bytes::Bytes;
use reqwest::Client;
use tracing::info;
use url::Url;

use super::identity::IdentityOverlay;
use super::request::{FORWARDED_URL, ProxyResponse, ROUTING_HEADERS};
use crate::config::UpstreamConfig;
use crate::{Error, Result};

/// Request headers that describe the inbound hop only
const HOP_BY_HOP_REQUEST: [&str; 9] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

/// The request sent to the destination
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    /// Original method
    pub method: Method,
    /// Destination taken from the routing header
    pub url: Url,
    /// Filtered headers plus asserted identity
    pub headers: HeaderMap,
    /// Original body
    pub body: Bytes,
}

/// Transport capability used to reach destinations
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` and buffer the response.
    ///
    /// Only transport failures are errors; any HTTP status is a response.
    async fn dispatch(&self, request: OutboundRequest) -> Result<ProxyResponse>;
}

/// Rebuilds inbound requests for their destination
#[derive(Clone)]
pub struct RequestForwarder {
    upstream: Arc<dyn Upstream>,
}

impl RequestForwarder {
    /// Create a forwarder over `upstream`
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    /// Build the outbound request for `overlay`.
    ///
    /// Fails with [`Error::Routing`] when the destination header is missing or
    /// not an absolute URL.
    pub fn build(overlay: &IdentityOverlay<'_>) -> Result<OutboundRequest> {
        let request = overlay.request();

        // Read the real header only: the overlay's parameter fallback must
        // never choose the destination.
        let destination = request
            .headers
            .get(FORWARDED_URL)
            .ok_or_else(|| Error::Routing("No X-CF-Forwarded-Url header present".to_string()))?
            .to_str()
            .map_err(|_| Error::Routing("X-CF-Forwarded-Url is not valid text".to_string()))?;
        let url = Url::parse(destination)
            .map_err(|e| Error::Routing(format!("Invalid X-CF-Forwarded-Url '{destination}': {e}")))?;

        let mut headers = HeaderMap::new();
        let mut copied = HashSet::new();
        for name in overlay.header_names() {
            let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            if !copied.insert(header_name.clone()) || is_stripped(&header_name) {
                continue;
            }
            for value in overlay.header_values(header_name.as_str())? {
                headers.append(header_name.clone(), value);
            }
        }

        Ok(OutboundRequest {
            method: request.method.clone(),
            url,
            headers,
            body: request.body.clone(),
        })
    }

    /// Build and dispatch, returning the destination's response.
    pub async fn forward(&self, overlay: &IdentityOverlay<'_>) -> Result<ProxyResponse> {
        let request = overlay.request();
        info!(method = %request.method, uri = %request.uri, "Incoming request");

        let outgoing = Self::build(overlay)?;
        info!(method = %outgoing.method, target = %outgoing.url, "Outgoing request");

        let response = self.upstream.dispatch(outgoing).await?;
        Ok(response.without_hop_by_hop())
    }
}

fn is_stripped(name: &HeaderName) -> bool {
    let name = name.as_str();
    ROUTING_HEADERS.contains(&name) || HOP_BY_HOP_REQUEST.contains(&name)
}

/// Pooled HTTP transport.
///
/// Redirects are relayed rather than followed, and bodies are passed through
/// without decompression.
pub struct HttpUpstream {
    client: Client,
}

impl HttpUpstream {
    /// Build the client from config
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .no_deflate()
            .no_brotli()
            .build()
            .map_err(|e| Error::Upstream(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn dispatch(&self, request: OutboundRequest) -> Result<ProxyResponse> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(format!("Failed to read response body: {e}")))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
