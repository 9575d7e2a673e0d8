//! Bounded-retry execution of upstream attempts with exponential backoff
//! and, where a route allows it, stale-cache fallback on exhaustion.

use crate::cache::{CacheEntry, ResponseCache};
use crate::common::ProxyMetrics;
use crate::error::ProxyError;
use crate::routes::RouteRule;
use crate::upstream::RawResponse;
use hyper::StatusCode;
use log::{info, warn};
use std::future::Future;
use std::sync::Arc;

/// How a retried request ultimately resolved.
#[derive(Debug)]
pub enum RetryOutcome {
    /// An attempt produced a response; non-2xx statuses other than 408 are
    /// delivered verbatim, the upstream's error payload included.
    Delivered(RawResponse),
    /// Every attempt failed but an old cache entry was eligible to serve.
    Fallback(CacheEntry),
}

/// 408 is the sandbox's way of reporting a gateway-side timeout; everything
/// else is the upstream's own answer.
pub fn retryable_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
}

pub struct RetryController {
    cache: ResponseCache,
    metrics: Arc<ProxyMetrics>,
}

impl RetryController {
    pub fn new(cache: ResponseCache, metrics: Arc<ProxyMetrics>) -> Self {
        Self { cache, metrics }
    }

    /// Drive `attempt_fn` until it delivers, a fatal error surfaces, or the
    /// rule's retry budget runs out. `cache_key` enables stale fallback for
    /// rules that permit it.
    pub async fn run<F, Fut>(
        &self,
        rule: &RouteRule,
        cache_key: Option<&str>,
        mut attempt_fn: F,
    ) -> Result<RetryOutcome, ProxyError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<RawResponse, ProxyError>>,
    {
        let mut last_reason = String::new();

        for attempt in 1..=rule.max_retries {
            self.metrics.upstream_attempts.inc();
            match attempt_fn(attempt).await {
                Ok(response) if retryable_status(response.status) => {
                    last_reason = format!("upstream returned {}", response.status);
                }
                Ok(response) => return Ok(RetryOutcome::Delivered(response)),
                Err(e) if e.is_transport() => {
                    last_reason = e.to_string();
                }
                Err(e) => return Err(e),
            }

            warn!(
                "Attempt {}/{} for {} failed: {}",
                attempt, rule.max_retries, rule.path_prefix, last_reason
            );
            if attempt < rule.max_retries {
                tokio::time::sleep(rule.backoff_delay(attempt)).await;
            }
        }

        if rule.allow_stale_fallback {
            if let Some(key) = cache_key {
                if let Some(entry) = self.cache.lookup_any(key).await {
                    self.metrics.stale_fallbacks.inc();
                    info!(
                        "Serving cached entry for {} after {} failed attempts",
                        key, rule.max_retries
                    );
                    return Ok(RetryOutcome::Fallback(entry));
                }
            }
        }

        self.metrics.retries_exhausted.inc();
        Err(ProxyError::RetriesExhausted {
            attempts: rule.max_retries,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hyper::header::HeaderMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn controller() -> (RetryController, ResponseCache, Arc<ProxyMetrics>) {
        let metrics = Arc::new(ProxyMetrics::new());
        let cache = ResponseCache::new(metrics.clone());
        (
            RetryController::new(cache.clone(), metrics.clone()),
            cache,
            metrics,
        )
    }

    fn fast_rule(max_retries: u32) -> RouteRule {
        RouteRule {
            max_retries,
            base_backoff_ms: 10,
            backoff_cap_ms: 40,
            ..RouteRule::default()
        }
    }

    fn response(status: StatusCode) -> RawResponse {
        RawResponse {
            status,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn first_success_is_delivered() {
        let (controller, _, metrics) = controller();
        let outcome = controller
            .run(&fast_rule(3), None, |_| async { Ok(response(StatusCode::OK)) })
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RetryOutcome::Delivered(r) if r.status == StatusCode::OK
        ));
        assert_eq!(metrics.snapshot().upstream_attempts, 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried_with_backoff() {
        let (controller, _, metrics) = controller();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let started = Instant::now();
        let outcome = controller
            .run(&fast_rule(3), None, move |_| {
                let calls = calls_in.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(ProxyError::Connection("connection refused".to_string()))
                    } else {
                        Ok(response(StatusCode::OK))
                    }
                }
            })
            .await
            .unwrap();

        assert!(matches!(outcome, RetryOutcome::Delivered(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps: 10ms then 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(metrics.snapshot().upstream_attempts, 3);
    }

    #[tokio::test]
    async fn request_timeout_status_consumes_an_attempt() {
        let (controller, _, _) = controller();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let outcome = controller
            .run(&fast_rule(3), None, move |_| {
                let calls = calls_in.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        Ok(response(StatusCode::REQUEST_TIMEOUT))
                    } else {
                        Ok(response(StatusCode::OK))
                    }
                }
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            RetryOutcome::Delivered(r) if r.status == StatusCode::OK
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn upstream_error_statuses_pass_through_without_retry() {
        let (controller, _, _) = controller();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let outcome = controller
            .run(&fast_rule(3), None, move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(response(StatusCode::UNPROCESSABLE_ENTITY))
                }
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            RetryOutcome::Delivered(r) if r.status == StatusCode::UNPROCESSABLE_ENTITY
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_errors_propagate_immediately() {
        let (controller, _, metrics) = controller();
        let err = controller
            .run(&fast_rule(3), None, |_| async {
                Err(ProxyError::Config("bad rule".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
        assert_eq!(metrics.snapshot().upstream_attempts, 1);
    }

    #[tokio::test]
    async fn exhaustion_without_fallback_reports_attempts() {
        let (controller, _, metrics) = controller();
        let err = controller
            .run(&fast_rule(2), Some("GET /raas/masters/v1/codes"), |_| async {
                Err(ProxyError::Connection("connection refused".to_string()))
            })
            .await
            .unwrap_err();

        match err {
            ProxyError::RetriesExhausted { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(metrics.snapshot().retries_exhausted, 1);
    }

    #[tokio::test]
    async fn exhaustion_serves_stale_entry_when_allowed() {
        let (controller, cache, metrics) = controller();
        cache
            .insert(
                "GET /raas/masters/v1/service-corridor".to_string(),
                CacheEntry::new(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::from_static(b"[{\"corridor\":\"AE-PK\"}]"),
                    Duration::ZERO,
                    true,
                    None,
                ),
            )
            .await;

        let rule = RouteRule {
            allow_stale_fallback: true,
            ..fast_rule(2)
        };
        let outcome = controller
            .run(&rule, Some("GET /raas/masters/v1/service-corridor"), |_| async {
                Err(ProxyError::Connection("connection refused".to_string()))
            })
            .await
            .unwrap();

        match outcome {
            RetryOutcome::Fallback(entry) => {
                assert_eq!(entry.status, StatusCode::OK);
                assert!(!entry.is_fresh());
            }
            RetryOutcome::Delivered(_) => panic!("expected fallback"),
        }
        assert_eq!(metrics.snapshot().stale_fallbacks, 1);
        assert_eq!(metrics.snapshot().retries_exhausted, 0);
    }

    #[tokio::test]
    async fn final_attempt_timeout_still_falls_back() {
        let (controller, cache, _) = controller();
        cache
            .insert(
                "GET /raas/masters/v1/codes".to_string(),
                CacheEntry::new(
                    StatusCode::OK,
                    HeaderMap::new(),
                    Bytes::from_static(b"{}"),
                    Duration::ZERO,
                    true,
                    None,
                ),
            )
            .await;

        let rule = RouteRule {
            allow_stale_fallback: true,
            ..fast_rule(2)
        };
        // Every attempt answers 408, which is retryable, so exhaustion must
        // reach the fallback path rather than deliver the 408.
        let outcome = controller
            .run(&rule, Some("GET /raas/masters/v1/codes"), |_| async {
                Ok(response(StatusCode::REQUEST_TIMEOUT))
            })
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::Fallback(_)));
    }
}
