//! HTTP listener and request routing. Inbound requests are buffered,
//! classified against the route table, then dispatched through the
//! credential, cache, and retry layers to the upstream sandbox.

use crate::cache::{self, CacheEntry, ResponseCache};
use crate::common::{ProxyMetrics, RequestTimer, ResponseBuilder};
use crate::config::Config;
use crate::credentials::CredentialManager;
use crate::error::ProxyError;
use crate::retry::{RetryController, RetryOutcome};
use crate::routes::{RouteClass, RouteRule, RouteTable};
use crate::upstream::{HttpsTransport, RawResponse, UpstreamClient, UpstreamTransport};
use bytes::Bytes;
use http::request::Parts;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Token fields captured opportunistically from auth-passthrough responses.
#[derive(Deserialize)]
struct PassthroughToken {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// One handler instance serves every connection.
pub struct RequestHandler {
    routes: RouteTable,
    cache: ResponseCache,
    credentials: CredentialManager,
    upstream: Arc<UpstreamClient>,
    retry: RetryController,
    metrics: Arc<ProxyMetrics>,
    max_body_bytes: usize,
    started_at: Instant,
}

impl RequestHandler {
    pub fn new(config: &Config, transport: Arc<dyn UpstreamTransport>) -> Self {
        let metrics = Arc::new(ProxyMetrics::new());
        let upstream = Arc::new(UpstreamClient::new(
            config.upstream_origin(),
            config.partner.clone(),
            transport,
        ));
        let credentials = CredentialManager::new(
            upstream.clone(),
            config.credentials.clone(),
            config.upstream.auth_path.clone(),
            metrics.clone(),
        );
        let cache = ResponseCache::new(metrics.clone());
        let retry = RetryController::new(cache.clone(), metrics.clone());
        let rules = if config.routes.is_empty() {
            RouteRule::default_table(&config.upstream.auth_path)
        } else {
            config.routes.clone()
        };

        Self {
            routes: RouteTable::new(rules),
            cache,
            credentials,
            upstream,
            retry,
            metrics,
            max_body_bytes: config.max_body_bytes,
            started_at: Instant::now(),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Entry point for live connections: buffer the body (bounded), then
    /// hand off to `handle`.
    pub async fn serve(&self, request: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
        let (parts, body) = request.into_parts();
        match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => self.handle(parts, collected.to_bytes()).await,
            Err(e) => {
                self.metrics.requests_total.inc();
                warn!(
                    "Failed to buffer request body (limit {} bytes): {}",
                    self.max_body_bytes, e
                );
                ResponseBuilder::failure(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    41300,
                    "Request body too large",
                    None,
                )
            }
        }
    }

    /// Route a fully buffered request and always produce a response; errors
    /// are mapped to the structured failure envelope here and never escape.
    pub async fn handle(&self, parts: Parts, body: Bytes) -> Response<Full<Bytes>> {
        self.metrics.requests_total.inc();
        let timer = RequestTimer::start();
        let method = parts.method.clone();
        let raw_path = parts.uri.path().to_string();

        let mut response = match self.dispatch(&parts, body).await {
            Ok(response) => response,
            Err(e) => self.error_response(&raw_path, e),
        };

        // Single choke point: every response leaves with CORS applied,
        // passthrough upstream responses included.
        ResponseBuilder::apply_cors(&mut response);
        timer.finish(&method, &raw_path, response.status());
        response
    }

    async fn dispatch(
        &self,
        parts: &Parts,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        if parts.method == Method::OPTIONS {
            return Ok(ResponseBuilder::preflight());
        }

        let path = parts.uri.path();
        if path == "/" || path == "/health" {
            return Ok(self.health_response().await);
        }
        if path == "/metrics" {
            return Ok(self.metrics_response());
        }

        let Some(api_path) = strip_api_prefix(path) else {
            return Ok(not_found(path));
        };
        let query = parts.uri.query();

        let Some(rule) = self.routes.classify(&parts.method, api_path) else {
            return Ok(not_found(path));
        };
        debug!(
            "{} {} classified as {} via {}",
            parts.method,
            api_path,
            rule.class.as_str(),
            rule.path_prefix
        );

        if rule.class == RouteClass::Identity {
            self.handle_identity(rule, parts, api_path, query, body)
                .await
        } else if rule.caches_method(&parts.method) {
            self.handle_cacheable(rule, parts, api_path, query, body)
                .await
        } else {
            self.handle_forward(rule, parts, api_path, query, body)
                .await
        }
    }

    /// Auth passthrough: the exchange goes upstream untouched, and a token
    /// in a successful reply is captured for proxied requests.
    async fn handle_identity(
        &self,
        rule: &RouteRule,
        parts: &Parts,
        path: &str,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        let path_and_query = join_path_query(path, query);
        let response = self
            .upstream
            .forward_auth(
                parts.method.clone(),
                &path_and_query,
                &parts.headers,
                body,
                rule.request_timeout(),
            )
            .await?;

        if response.status.is_success() {
            // Capture is best-effort; a body we cannot parse still goes
            // back to the caller untouched.
            if let Ok(token) = serde_json::from_slice::<PassthroughToken>(&response.body) {
                self.credentials
                    .store_external(token.access_token, token.expires_in)
                    .await;
            }
        }

        Ok(raw_to_response(response))
    }

    async fn handle_cacheable(
        &self,
        rule: &RouteRule,
        parts: &Parts,
        path: &str,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        let key = cache::cache_key(rule, &parts.method, path, query, &body);
        if let Some(entry) = self.cache.lookup(&key).await {
            debug!("Cache hit for {}", key);
            return Ok(cache_entry_response(entry, "HIT"));
        }

        let bearer = self.bearer_for(rule).await?;
        let path_and_query = join_path_query(path, query);
        let outbound_body = effective_body(rule, &parts.method, body);

        let outcome = self
            .retry
            .run(rule, Some(&key), |_| {
                self.upstream.forward_api(
                    parts.method.clone(),
                    &path_and_query,
                    &parts.headers,
                    bearer.as_deref(),
                    outbound_body.clone(),
                    rule.request_timeout(),
                )
            })
            .await?;

        match outcome {
            RetryOutcome::Delivered(response) => {
                self.cache
                    .store(
                        key,
                        rule,
                        response.status,
                        response.headers.clone(),
                        response.body.clone(),
                    )
                    .await;
                let mut response = raw_to_response(response);
                response
                    .headers_mut()
                    .insert("X-Cache", HeaderValue::from_static("MISS"));
                Ok(response)
            }
            RetryOutcome::Fallback(entry) => {
                let mut response = cache_entry_response(entry, "FALLBACK");
                // Stale data is served as a successful answer by contract.
                *response.status_mut() = StatusCode::OK;
                Ok(response)
            }
        }
    }

    /// Transactional and capture routes: no cache involvement, upstream
    /// answer passed through verbatim.
    async fn handle_forward(
        &self,
        rule: &RouteRule,
        parts: &Parts,
        path: &str,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>, ProxyError> {
        let bearer = self.bearer_for(rule).await?;
        let path_and_query = join_path_query(path, query);
        let outbound_body = effective_body(rule, &parts.method, body);

        let outcome = self
            .retry
            .run(rule, None, |_| {
                self.upstream.forward_api(
                    parts.method.clone(),
                    &path_and_query,
                    &parts.headers,
                    bearer.as_deref(),
                    outbound_body.clone(),
                    rule.request_timeout(),
                )
            })
            .await?;

        match outcome {
            RetryOutcome::Delivered(response) => Ok(raw_to_response(response)),
            // Unreachable without a cache key, but kept total.
            RetryOutcome::Fallback(entry) => {
                let mut response = cache_entry_response(entry, "FALLBACK");
                *response.status_mut() = StatusCode::OK;
                Ok(response)
            }
        }
    }

    async fn bearer_for(&self, rule: &RouteRule) -> Result<Option<String>, ProxyError> {
        if rule.requires_auth {
            Ok(Some(self.credentials.token().await?))
        } else {
            Ok(None)
        }
    }

    async fn health_response(&self) -> Response<Full<Bytes>> {
        let summary = self.metrics.snapshot();
        let credential = self.credentials.status().await;
        let body = json!({
            "status": "success",
            "message": "Remittance sandbox proxy is running",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "uptime_secs": self.started_at.elapsed().as_secs(),
            "cache": {
                "size": self.cache.len().await,
                "hits": summary.cache_hits,
                "misses": summary.cache_misses,
                "evictions": summary.cache_evictions,
                "stale_fallbacks": summary.stale_fallbacks,
            },
            "upstream": {
                "attempts": summary.upstream_attempts,
                "retries_exhausted": summary.retries_exhausted,
            },
            "credential": {
                "cached": credential.cached,
                "usable": credential.usable,
                "refreshes": summary.token_refreshes,
            },
        });
        ResponseBuilder::json(StatusCode::OK, &body)
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.metrics.encode_prometheus())));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        response
    }

    fn error_response(&self, path: &str, error: ProxyError) -> Response<Full<Bytes>> {
        match &error {
            ProxyError::Auth(reason) => {
                warn!("Authentication failed for {}: {}", path, reason);
                ResponseBuilder::failure(
                    StatusCode::UNAUTHORIZED,
                    40001,
                    "Authentication failed",
                    None,
                )
            }
            ProxyError::RetriesExhausted { attempts, reason } => {
                error!(
                    "Upstream unavailable for {} after {} attempts: {}",
                    path, attempts, reason
                );
                ResponseBuilder::failure(
                    StatusCode::BAD_GATEWAY,
                    50200,
                    "Proxy request failed after retries",
                    Some(&format!("{} ({} attempts)", reason, attempts)),
                )
            }
            ProxyError::Io(_) | ProxyError::Connection(_) | ProxyError::Hyper(_) => {
                error!("Upstream transport failure for {}: {}", path, error);
                ResponseBuilder::failure(
                    StatusCode::BAD_GATEWAY,
                    50200,
                    "Proxy request failed",
                    Some(&error.to_string()),
                )
            }
            _ => {
                error!("Request handling failed for {}: {}", path, error);
                ResponseBuilder::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    50000,
                    "Request failed",
                    Some(&error.to_string()),
                )
            }
        }
    }
}

/// The HTTP server: binds, then serves connections until aborted.
pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<RequestHandler>,
    sweep_interval: Duration,
}

impl ProxyServer {
    pub async fn bind(config: &Config) -> Result<Self, ProxyError> {
        let transport = Arc::new(HttpsTransport::new(&config.upstream));
        Self::bind_with_transport(config, transport).await
    }

    /// Bind with an injected transport; tests use scripted transports to
    /// exercise the full HTTP surface without a live upstream.
    pub async fn bind_with_transport(
        config: &Config,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<Self, ProxyError> {
        let handler = Arc::new(RequestHandler::new(config, transport));
        let addr = config.listen_addr()?;
        info!("Binding HTTP listener to: {}", addr);
        let listener = TcpListener::bind(&addr).await.map_err(ProxyError::Io)?;
        Ok(Self {
            listener,
            handler,
            sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        self.listener.local_addr().map_err(ProxyError::Io)
    }

    pub fn handler(&self) -> Arc<RequestHandler> {
        self.handler.clone()
    }

    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.handler
            .cache()
            .clone()
            .spawn_sweeper(self.sweep_interval)
    }

    /// Pre-fetch the service-account token so the first proxied request
    /// does not pay the identity round trip.
    pub async fn warm_credentials(&self) -> Result<(), ProxyError> {
        self.handler.credentials().warm().await
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        let addr = self.local_addr()?;
        info!("Proxy listening on: http://{}", addr);

        loop {
            let (stream, remote_addr) = self.listener.accept().await.map_err(ProxyError::Io)?;
            let handler = self.handler.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |request| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler.serve(request).await) }
                });

                if let Err(e) = ServerBuilder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    error!("Error serving connection from {}: {}", remote_addr, e);
                }
            });
        }
    }
}

/// API traffic lives under `/api/*`; the prefix is stripped before the
/// route table sees the path. Non-API paths return `None`.
fn strip_api_prefix(path: &str) -> Option<&str> {
    if path == "/api" {
        Some("/")
    } else if path.starts_with("/api/") {
        Some(&path[4..])
    } else {
        None
    }
}

fn join_path_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

/// Portal users may POST with an empty body to probe an endpoint; rules can
/// supply the payload that makes such a probe meaningful.
fn effective_body(rule: &RouteRule, method: &Method, body: Bytes) -> Bytes {
    if *method == Method::POST && body.is_empty() {
        if let Some(default) = &rule.default_post_body {
            return Bytes::from(default.to_string());
        }
    }
    body
}

fn raw_to_response(raw: RawResponse) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(raw.body));
    *response.status_mut() = raw.status;
    *response.headers_mut() = raw.headers;
    response
}

fn cache_entry_response(entry: CacheEntry, marker: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(entry.body));
    *response.status_mut() = entry.status;
    *response.headers_mut() = entry.headers;
    response
        .headers_mut()
        .insert("X-Cache", HeaderValue::from_static(marker));
    response
}

fn not_found(path: &str) -> Response<Full<Bytes>> {
    ResponseBuilder::failure(
        StatusCode::NOT_FOUND,
        40400,
        "Endpoint not found",
        Some(&format!("No handler defined for {}", path)),
    )
}
