//! In-memory response cache keyed by normalized request identity.
//!
//! Entries expire by TTL but rules may keep them past expiry so the retry
//! layer can serve stale data when the upstream is unreachable. A background
//! sweeper evicts what nothing is allowed to fall back to anymore.

use crate::common::ProxyMetrics;
use crate::routes::RouteRule;
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use log::{debug, info};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A stored upstream response plus the policy that governs its lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    stored_at: Instant,
    ttl: Duration,
    keep_stale: bool,
    stale_grace: Option<Duration>,
}

impl CacheEntry {
    pub fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        ttl: Duration,
        keep_stale: bool,
        stale_grace: Option<Duration>,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            stored_at: Instant::now(),
            ttl,
            keep_stale,
            stale_grace,
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.stored_at.elapsed() < self.ttl
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// Expired entries linger while a fallback rule may still want them;
    /// `stale_grace: None` retains them until overwritten.
    fn evictable(&self) -> bool {
        if self.is_fresh() {
            return false;
        }
        if !self.keep_stale {
            return true;
        }
        match self.stale_grace {
            None => false,
            Some(grace) => self.stored_at.elapsed() >= self.ttl + grace,
        }
    }
}

/// Shared cache handle. Cloning is cheap; all clones see the same entries.
#[derive(Clone)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
    metrics: Arc<ProxyMetrics>,
}

impl ResponseCache {
    pub fn new(metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// Fresh entry for `key`, counting a hit or miss. A stale entry counts
    /// as a miss here; only the fallback path may use it.
    pub async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.metrics.cache_hits.inc();
                Some(entry.clone())
            }
            _ => {
                self.metrics.cache_misses.inc();
                None
            }
        }
    }

    /// Any entry for `key`, fresh or stale. Used when retries are exhausted
    /// and a rule permits serving old data.
    pub async fn lookup_any(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().await;
        entries.get(key).cloned()
    }

    /// Store a response under `rule`'s lifetime policy. Non-2xx responses
    /// are never cached.
    pub async fn store(
        &self,
        key: String,
        rule: &RouteRule,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) {
        if !status.is_success() {
            debug!("Not caching {} response for {}", status, key);
            return;
        }
        let entry = CacheEntry::new(
            status,
            headers,
            body,
            rule.ttl(),
            rule.allow_stale_fallback,
            rule.stale_grace(),
        );
        self.insert(key, entry).await;
    }

    pub async fn insert(&self, key: String, entry: CacheEntry) {
        let mut entries = self.entries.lock().await;
        entries.insert(key, entry);
    }

    /// Drop entries that are past TTL and past any fallback grace. Returns
    /// how many were evicted.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.evictable());
        let evicted = before - entries.len();
        if evicted > 0 {
            self.metrics.cache_evictions.inc_by(evicted as u64);
        }
        evicted
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Periodic sweep task. The handle can be aborted at shutdown.
    pub fn spawn_sweeper(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh start
            // does not sweep an empty map.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = self.sweep().await;
                if evicted > 0 {
                    info!("Cache sweep evicted {} expired entries", evicted);
                }
            }
        })
    }
}

/// Build the cache identity for a request: method, normalized path, the
/// query string when the rule keys on it, and a digest of the POST body
/// when the rule caches POSTs.
pub fn cache_key(
    rule: &RouteRule,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: &[u8],
) -> String {
    let mut key = String::with_capacity(path.len() + 24);
    key.push_str(method.as_str());
    key.push(' ');
    key.push_str(&normalize_path(path));
    if rule.include_query_in_key {
        if let Some(q) = query {
            if !q.is_empty() {
                key.push('?');
                key.push_str(q);
            }
        }
    }
    if *method == Method::POST && rule.cache_post_bodies && !body.is_empty() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        body.hash(&mut hasher);
        key.push('#');
        key.push_str(&format!("{:016x}", hasher.finish()));
    }
    key
}

/// Percent-decode, collapse duplicate slashes, and trim the trailing slash
/// so `/raas//masters/v1/codes/` and `/raas/masters/v1/codes` share one
/// entry.
fn normalize_path(path: &str) -> String {
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    let mut out = String::with_capacity(decoded.len());
    let mut prev_slash = false;
    for ch in decoded.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
