//! Upstream HTTP client. Every business request goes out with a freshly
//! built header set; inbound headers are never forwarded wholesale.

use crate::config::{PartnerDefaults, UpstreamConfig};
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION,
    CONTENT_TYPE, TRANSFER_ENCODING,
};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Seam between request construction and the wire. Tests drive the proxy
/// through scripted implementations of this trait.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn roundtrip(
        &self,
        request: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<RawResponse, ProxyError>;
}

/// Pooled TLS transport used in production.
pub struct HttpsTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpsTransport {
    pub fn new(config: &UpstreamConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build::<_, Full<Bytes>>(HttpsConnector::new());
        Self { client }
    }
}

#[async_trait]
impl UpstreamTransport for HttpsTransport {
    async fn roundtrip(
        &self,
        request: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<RawResponse, ProxyError> {
        let response = tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::Connection("Request timeout".to_string()))?
            .map_err(|e| ProxyError::Hyper(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Hyper(e.to_string()))?
            .to_bytes();

        Ok(RawResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

/// Builds and sends requests against the sandbox origin.
pub struct UpstreamClient {
    transport: Arc<dyn UpstreamTransport>,
    origin: String,
    partner: PartnerDefaults,
}

impl UpstreamClient {
    pub fn new(
        origin: String,
        partner: PartnerDefaults,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Self {
        Self {
            transport,
            origin,
            partner,
        }
    }

    /// Business-API request: JSON defaults, partner headers (inbound value
    /// wins, configured default otherwise), optional bearer token.
    pub async fn forward_api(
        &self,
        method: Method,
        path_and_query: &str,
        inbound: &HeaderMap,
        bearer: Option<&str>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<RawResponse, ProxyError> {
        let mut request = self.base_request(method, path_and_query, body)?;
        let headers = request.headers_mut();

        let content_type = inbound
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, content_type);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, deflate"));

        for (name, fallback) in self.partner.pairs() {
            let header_name = HeaderName::from_static(name);
            if let Some(value) = inbound.get(&header_name) {
                headers.insert(header_name, value.clone());
            } else if !fallback.is_empty() {
                if let Ok(value) = HeaderValue::from_str(fallback) {
                    headers.insert(header_name, value);
                }
            }
        }

        if let Some(token) = bearer {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }

        self.send(request, timeout).await
    }

    /// Identity-endpoint request: body and content type pass through
    /// untouched so the credential exchange stays exactly what the caller
    /// composed.
    pub async fn forward_auth(
        &self,
        method: Method,
        path_and_query: &str,
        inbound: &HeaderMap,
        body: Bytes,
        timeout: Duration,
    ) -> Result<RawResponse, ProxyError> {
        let mut request = self.base_request(method, path_and_query, body)?;
        let content_type = inbound
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("application/x-www-form-urlencoded"));
        request.headers_mut().insert(CONTENT_TYPE, content_type);

        self.send(request, timeout).await
    }

    fn base_request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, ProxyError> {
        let uri: Uri = format!("{}{}", self.origin, path_and_query)
            .parse()
            .map_err(|e| ProxyError::Uri(format!("{}: {}", path_and_query, e)))?;

        let mut request = Request::new(Full::new(body));
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        Ok(request)
    }

    async fn send(
        &self,
        request: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<RawResponse, ProxyError> {
        debug!("-> {} {}", request.method(), request.uri());
        let mut response = self.transport.roundtrip(request, timeout).await?;
        sanitize_response_headers(&mut response.headers);
        debug!("<- {} ({} bytes)", response.status, response.body.len());
        Ok(response)
    }
}

/// Responses are re-framed by this server, so connection-level headers from
/// the upstream must not leak through.
pub(crate) fn sanitize_response_headers(headers: &mut HeaderMap) {
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONNECTION);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct CaptureTransport {
        seen: Mutex<Option<(Method, Uri, HeaderMap)>>,
    }

    impl CaptureTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(None),
            })
        }

        async fn captured(&self) -> (Method, Uri, HeaderMap) {
            self.seen.lock().await.clone().unwrap()
        }
    }

    #[async_trait]
    impl UpstreamTransport for CaptureTransport {
        async fn roundtrip(
            &self,
            request: Request<Full<Bytes>>,
            _timeout: Duration,
        ) -> Result<RawResponse, ProxyError> {
            let mut seen = self.seen.lock().await;
            *seen = Some((
                request.method().clone(),
                request.uri().clone(),
                request.headers().clone(),
            ));

            let mut headers = HeaderMap::new();
            headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
            headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Ok(RawResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"{}"),
            })
        }
    }

    fn client(transport: Arc<CaptureTransport>, partner: PartnerDefaults) -> UpstreamClient {
        UpstreamClient::new(
            "https://sandbox.example.test:443".to_string(),
            partner,
            transport,
        )
    }

    #[tokio::test]
    async fn api_requests_carry_standard_headers() {
        let transport = CaptureTransport::new();
        let client = client(transport.clone(), PartnerDefaults::default());

        client
            .forward_api(
                Method::GET,
                "/raas/masters/v1/codes",
                &HeaderMap::new(),
                Some("tok-123"),
                Bytes::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let (method, uri, headers) = transport.captured().await;
        assert_eq!(method, Method::GET);
        assert_eq!(
            uri.to_string(),
            "https://sandbox.example.test:443/raas/masters/v1/codes"
        );
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(headers.get(ACCEPT_ENCODING).unwrap(), "gzip, deflate");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
        // Only non-empty partner defaults are injected.
        assert_eq!(headers.get("channel").unwrap(), "Direct");
        assert!(headers.get("sender").is_none());
    }

    #[tokio::test]
    async fn inbound_partner_headers_override_defaults() {
        let transport = CaptureTransport::new();
        let partner = PartnerDefaults {
            sender: "configured-agent".to_string(),
            ..PartnerDefaults::default()
        };
        let client = client(transport.clone(), partner);

        let mut inbound = HeaderMap::new();
        inbound.insert("sender", HeaderValue::from_static("caller-agent"));

        client
            .forward_api(
                Method::POST,
                "/amr/ras/api/v1_0/ras/quote",
                &inbound,
                None,
                Bytes::from_static(b"{}"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let (_, _, headers) = transport.captured().await;
        assert_eq!(headers.get("sender").unwrap(), "caller-agent");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn config_defaults_fill_missing_partner_headers() {
        let transport = CaptureTransport::new();
        let partner = PartnerDefaults {
            sender: "configured-agent".to_string(),
            company: "784825".to_string(),
            ..PartnerDefaults::default()
        };
        let client = client(transport.clone(), partner);

        client
            .forward_api(
                Method::GET,
                "/raas/masters/v1/banks",
                &HeaderMap::new(),
                None,
                Bytes::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let (_, _, headers) = transport.captured().await;
        assert_eq!(headers.get("sender").unwrap(), "configured-agent");
        assert_eq!(headers.get("company").unwrap(), "784825");
        assert!(headers.get("branch").is_none());
    }

    #[tokio::test]
    async fn connection_level_headers_are_stripped_from_responses() {
        let transport = CaptureTransport::new();
        let client = client(transport.clone(), PartnerDefaults::default());

        let response = client
            .forward_api(
                Method::GET,
                "/raas/masters/v1/codes",
                &HeaderMap::new(),
                None,
                Bytes::new(),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert!(response.headers.get(TRANSFER_ENCODING).is_none());
        assert!(response.headers.get(CONNECTION).is_none());
        assert_eq!(
            response.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn auth_forwarding_keeps_form_content_type() {
        let transport = CaptureTransport::new();
        let client = client(transport.clone(), PartnerDefaults::default());

        client
            .forward_auth(
                Method::POST,
                "/auth/realms/cdp/protocol/openid-connect/token",
                &HeaderMap::new(),
                Bytes::from_static(b"grant_type=password"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let (method, _, headers) = transport.captured().await;
        assert_eq!(method, Method::POST);
        assert_eq!(
            headers.get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert!(headers.get("channel").is_none());
    }
}
