use crate::error::ProxyError;
use hyper::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Behavioral family a path belongs to. The tag itself only feeds logging;
/// the policy lives in the rule fields so operators can tune any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Masters,
    Rates,
    Transactional,
    Identity,
    Capture,
}

impl RouteClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteClass::Masters => "masters",
            RouteClass::Rates => "rates",
            RouteClass::Transactional => "transactional",
            RouteClass::Identity => "identity",
            RouteClass::Capture => "capture",
        }
    }
}

fn default_ttl_secs() -> u64 {
    1800
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    5000
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_requires_auth() -> bool {
    true
}

/// One row of the route policy table: a path prefix bound to cache, retry and
/// auth behavior. Matching is longest-prefix-first, optionally narrowed by
/// method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub path_prefix: String,
    pub class: RouteClass,
    /// Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub cacheable: bool,
    /// POST responses are only cached when a rule opts in; the exact body
    /// bytes then become part of the cache identity.
    #[serde(default)]
    pub cache_post_bodies: bool,
    /// Reference endpoints ignore the query string by default; rules where
    /// the query selects the payload (rates) opt in.
    #[serde(default)]
    pub include_query_in_key: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub allow_stale_fallback: bool,
    /// How long the sweeper keeps an expired entry around for fallback use.
    /// `None` retains it until overwritten.
    #[serde(default)]
    pub stale_grace_secs: Option<u64>,
    #[serde(default = "default_requires_auth")]
    pub requires_auth: bool,
    /// Substituted for an empty POST body so portal users can probe the
    /// endpoint without composing a payload first.
    #[serde(default)]
    pub default_post_body: Option<serde_json::Value>,
}

impl Default for RouteRule {
    fn default() -> Self {
        Self {
            path_prefix: "/".to_string(),
            class: RouteClass::Transactional,
            methods: Vec::new(),
            cacheable: false,
            cache_post_bodies: false,
            include_query_in_key: false,
            ttl_secs: default_ttl_secs(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            allow_stale_fallback: false,
            stale_grace_secs: None,
            requires_auth: default_requires_auth(),
            default_post_body: None,
        }
    }
}

impl RouteRule {
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
        {
            return false;
        }
        path.starts_with(&self.path_prefix)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stale_grace(&self) -> Option<Duration> {
        self.stale_grace_secs.map(Duration::from_secs)
    }

    /// `min(base · 2^(attempt-1), cap)` for the 1-based attempt that just
    /// failed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay_ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms);
        Duration::from_millis(delay_ms)
    }

    /// Whether a request with this method may be served from / stored into
    /// the cache under this rule.
    pub fn caches_method(&self, method: &Method) -> bool {
        if !self.cacheable {
            return false;
        }
        match *method {
            Method::GET => true,
            Method::POST => self.cache_post_bodies,
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.path_prefix.is_empty() {
            return Err(ProxyError::Config(
                "Route rule has an empty path prefix".to_string(),
            ));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(ProxyError::Config(format!(
                "Route prefix must start with '/': {}",
                self.path_prefix
            )));
        }
        if self.max_retries == 0 {
            return Err(ProxyError::Config(format!(
                "Route {} must allow at least one attempt",
                self.path_prefix
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ProxyError::Config(format!(
                "Route {} has a zero request timeout",
                self.path_prefix
            )));
        }
        if self.cacheable && self.ttl_secs == 0 {
            return Err(ProxyError::Config(format!(
                "Cacheable route {} has a zero TTL",
                self.path_prefix
            )));
        }
        Ok(())
    }

    /// The standard sandbox table: master data cached long with stale
    /// fallback, rates cached briefly keyed by query, document capture
    /// endpoints forwarded without a bearer token, everything else
    /// transactional.
    pub fn default_table(auth_path: &str) -> Vec<RouteRule> {
        let masters = |prefix: &str| RouteRule {
            path_prefix: prefix.to_string(),
            class: RouteClass::Masters,
            cacheable: true,
            ttl_secs: 1800,
            max_retries: 5,
            base_backoff_ms: 2000,
            backoff_cap_ms: 10_000,
            request_timeout_secs: 180,
            allow_stale_fallback: true,
            ..RouteRule::default()
        };
        let capture = |prefix: &str| RouteRule {
            path_prefix: prefix.to_string(),
            class: RouteClass::Capture,
            requires_auth: false,
            ..RouteRule::default()
        };

        vec![
            RouteRule {
                path_prefix: auth_path.to_string(),
                class: RouteClass::Identity,
                max_retries: 1,
                request_timeout_secs: 30,
                requires_auth: false,
                ..RouteRule::default()
            },
            masters("/raas/masters/v1/codes"),
            masters("/raas/masters/v1/service-corridor"),
            RouteRule {
                path_prefix: "/raas/masters/v1/rates".to_string(),
                class: RouteClass::Rates,
                cacheable: true,
                include_query_in_key: true,
                ttl_secs: 300,
                ..RouteRule::default()
            },
            masters("/raas/masters/"),
            RouteRule {
                path_prefix: "/amr/ras/api/v1_0/ras/quote".to_string(),
                class: RouteClass::Transactional,
                default_post_body: Some(json!({
                    "sending_country_code": "AE",
                    "sending_currency_code": "AED",
                    "receiving_country_code": "PK",
                    "receiving_currency_code": "PKR",
                    "sending_amount": 200,
                    "receiving_mode": "BANK",
                    "type": "SEND",
                    "instrument": "REMITTANCE"
                })),
                ..RouteRule::default()
            },
            capture("/ekyc/api/v1/efr/ocrDetection"),
            capture("/ekyc/api/v1/efr/faceLiveness"),
            capture("/ekyc/api/v1/efr/confirmIdentity"),
            capture("/ekyc/api/v1/request"),
            RouteRule::default(),
        ]
    }
}

/// Route rules sorted longest-prefix-first so the most specific rule wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(mut rules: Vec<RouteRule>) -> Self {
        rules.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { rules }
    }

    pub fn classify(&self, method: &Method, path: &str) -> Option<&RouteRule> {
        self.rules.iter().find(|rule| rule.matches(method, path))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
