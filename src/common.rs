//! Shared plumbing: prometheus counters, the JSON/CORS response builder,
//! and request timing.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Response, StatusCode};
use log::{debug, warn};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use serde_json::json;
use std::time::Instant;

pub const CORS_ALLOW_ORIGIN: &str = "*";
pub const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
pub const CORS_ALLOW_HEADERS: &str =
    "Content-Type, Authorization, sender, channel, company, branch";
pub const CORS_MAX_AGE: &str = "86400";

/// Counter set for one proxy instance. Counters live on an instance-local
/// registry so parallel test servers never collide; `/metrics` additionally
/// gathers the process-default registry used by the secret store.
pub struct ProxyMetrics {
    registry: Registry,
    pub requests_total: IntCounter,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_evictions: IntCounter,
    pub stale_fallbacks: IntCounter,
    pub upstream_attempts: IntCounter,
    pub retries_exhausted: IntCounter,
    pub token_refreshes: IntCounter,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| {
            let c = IntCounter::new(name, help).expect("Failed to create counter");
            if let Err(e) = registry.register(Box::new(c.clone())) {
                warn!("Failed to register metric {}: {}", name, e);
            }
            c
        };
        Self {
            requests_total: counter(
                "corridor_requests_total",
                "Total requests received by the proxy",
            ),
            cache_hits: counter("corridor_cache_hits_total", "Responses served from cache"),
            cache_misses: counter(
                "corridor_cache_misses_total",
                "Cache lookups that required an upstream call",
            ),
            cache_evictions: counter(
                "corridor_cache_evictions_total",
                "Entries removed by the cache sweeper",
            ),
            stale_fallbacks: counter(
                "corridor_stale_fallbacks_total",
                "Expired cache entries served because every retry failed",
            ),
            upstream_attempts: counter(
                "corridor_upstream_attempts_total",
                "Individual upstream request attempts, retries included",
            ),
            retries_exhausted: counter(
                "corridor_retries_exhausted_total",
                "Requests that failed every attempt with no fallback",
            ),
            token_refreshes: counter(
                "corridor_token_refreshes_total",
                "Bearer tokens fetched or captured from passthrough",
            ),
            registry,
        }
    }

    pub fn snapshot(&self) -> MetricsSummary {
        MetricsSummary {
            requests_total: self.requests_total.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_evictions: self.cache_evictions.get(),
            stale_fallbacks: self.stale_fallbacks.get(),
            upstream_attempts: self.upstream_attempts.get(),
            retries_exhausted: self.retries_exhausted.get(),
            token_refreshes: self.token_refreshes.get(),
        }
    }

    /// Text exposition of instance counters plus the default registry.
    pub fn encode_prometheus(&self) -> String {
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub requests_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub stale_fallbacks: u64,
    pub upstream_attempts: u64,
    pub retries_exhausted: u64,
    pub token_refreshes: u64,
}

/// Common response construction so every handler exit emits the same JSON
/// envelope and CORS headers.
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// JSON response with CORS applied.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self::apply_cors(&mut response);
        response
    }

    pub fn failure_body(
        error_code: u32,
        message: &str,
        description: Option<&str>,
    ) -> serde_json::Value {
        let mut body = json!({
            "status": "failure",
            "error_code": error_code,
            "message": message,
        });
        if let Some(description) = description {
            body["details"] = json!({ "description": description });
        }
        body
    }

    /// Standard failure envelope: `{"status":"failure","error_code":...}`.
    pub fn failure(
        status: StatusCode,
        error_code: u32,
        message: &str,
        description: Option<&str>,
    ) -> Response<Full<Bytes>> {
        Self::json(status, &Self::failure_body(error_code, message, description))
    }

    /// CORS preflight answer for OPTIONS requests.
    pub fn preflight() -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::OK;
        Self::apply_cors(&mut response);
        response
            .headers_mut()
            .insert("Access-Control-Max-Age", HeaderValue::from_static(CORS_MAX_AGE));
        response
    }

    /// Browser clients call the proxy cross-origin from the portal, so every
    /// response carries the same permissive CORS set.
    pub fn apply_cors(response: &mut Response<Full<Bytes>>) {
        let headers = response.headers_mut();
        headers.insert(
            "Access-Control-Allow-Origin",
            HeaderValue::from_static(CORS_ALLOW_ORIGIN),
        );
        headers.insert(
            "Access-Control-Allow-Methods",
            HeaderValue::from_static(CORS_ALLOW_METHODS),
        );
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static(CORS_ALLOW_HEADERS),
        );
    }
}

/// Request timing for completion logs.
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn finish(self, method: &Method, path: &str, status: StatusCode) {
        debug!(
            "{} {} -> {} ({}ms)",
            method,
            path,
            status.as_u16(),
            self.elapsed_ms()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_state() {
        let metrics = ProxyMetrics::new();
        metrics.requests_total.inc();
        metrics.cache_hits.inc();
        metrics.cache_hits.inc();

        let summary = metrics.snapshot();
        assert_eq!(summary.requests_total, 1);
        assert_eq!(summary.cache_hits, 2);
        assert_eq!(summary.cache_misses, 0);
    }

    #[test]
    fn exposition_contains_instance_counters() {
        let metrics = ProxyMetrics::new();
        metrics.upstream_attempts.inc();
        let text = metrics.encode_prometheus();
        assert!(text.contains("corridor_upstream_attempts_total 1"));
    }

    #[test]
    fn failure_body_shape() {
        let body = ResponseBuilder::failure_body(40400, "Endpoint not found", Some("No handler"));
        assert_eq!(body["status"], "failure");
        assert_eq!(body["error_code"], 40400);
        assert_eq!(body["message"], "Endpoint not found");
        assert_eq!(body["details"]["description"], "No handler");

        let bare = ResponseBuilder::failure_body(40001, "Authentication failed", None);
        assert!(bare.get("details").is_none());
    }

    #[test]
    fn every_builder_response_carries_cors() {
        let json = ResponseBuilder::json(StatusCode::OK, &json!({"ok": true}));
        assert_eq!(
            json.headers().get("Access-Control-Allow-Origin").unwrap(),
            "*"
        );

        let preflight = ResponseBuilder::preflight();
        assert_eq!(preflight.status(), StatusCode::OK);
        assert_eq!(
            preflight.headers().get("Access-Control-Max-Age").unwrap(),
            "86400"
        );
        assert_eq!(
            preflight
                .headers()
                .get("Access-Control-Allow-Headers")
                .unwrap(),
            CORS_ALLOW_HEADERS
        );
    }
}
