//! Service-account token lifecycle. One credential is shared by every
//! request; concurrent expiries collapse into a single refresh.

use crate::common::ProxyMetrics;
use crate::config::CredentialConfig;
use crate::error::ProxyError;
use crate::upstream::UpstreamClient;
use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::Method;
use log::{debug, info};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use url::form_urlencoded;

/// A bearer token and its validity window.
#[derive(Debug, Clone)]
pub struct Credential {
    token: String,
    expires_at: Instant,
}

impl Credential {
    fn new(token: String, lifetime: Duration) -> Self {
        Self {
            token,
            expires_at: Instant::now() + lifetime,
        }
    }

    /// Usable while now is at least `margin` before expiry, so a token is
    /// never presented in its final seconds.
    fn usable(&self, margin: Duration) -> bool {
        match self.expires_at.checked_sub(margin) {
            Some(deadline) => Instant::now() < deadline,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialStatus {
    pub cached: bool,
    pub usable: bool,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Caches the service-account token and refreshes it on demand.
pub struct CredentialManager {
    upstream: Arc<UpstreamClient>,
    config: CredentialConfig,
    auth_path: String,
    current: RwLock<Option<Credential>>,
    refresh_lock: Mutex<()>,
    metrics: Arc<ProxyMetrics>,
}

impl CredentialManager {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        config: CredentialConfig,
        auth_path: String,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            upstream,
            config,
            auth_path,
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            metrics,
        }
    }

    /// The current token, refreshing it first if the cached one is missing
    /// or inside its safety margin. On refresh failure the previous
    /// credential is left in place and the error propagates.
    pub async fn token(&self) -> Result<String, ProxyError> {
        let margin = Duration::from_secs(self.config.safety_margin_secs);

        {
            let current = self.current.read().await;
            if let Some(credential) = current.as_ref() {
                if credential.usable(margin) {
                    return Ok(credential.token.clone());
                }
            }
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited for the lock.
        {
            let current = self.current.read().await;
            if let Some(credential) = current.as_ref() {
                if credential.usable(margin) {
                    return Ok(credential.token.clone());
                }
            }
        }

        let credential = self.fetch().await?;
        let token = credential.token.clone();
        let mut current = self.current.write().await;
        *current = Some(credential);
        Ok(token)
    }

    /// Cache a token that arrived through the auth passthrough so the next
    /// proxied request reuses it instead of fetching its own.
    pub async fn store_external(&self, token: String, expires_in: Option<u64>) {
        let credential = self.credential_from(token, expires_in);
        let mut current = self.current.write().await;
        *current = Some(credential);
        self.metrics.token_refreshes.inc();
        debug!("Captured bearer token from auth passthrough");
    }

    pub async fn status(&self) -> CredentialStatus {
        let margin = Duration::from_secs(self.config.safety_margin_secs);
        let current = self.current.read().await;
        match current.as_ref() {
            Some(credential) => CredentialStatus {
                cached: true,
                usable: credential.usable(margin),
            },
            None => CredentialStatus {
                cached: false,
                usable: false,
            },
        }
    }

    /// Eager fetch for startup warm-up.
    pub async fn warm(&self) -> Result<(), ProxyError> {
        self.token().await.map(|_| ())
    }

    async fn fetch(&self) -> Result<Credential, ProxyError> {
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("username", &self.config.username)
            .append_pair("password", &self.config.password)
            .append_pair("grant_type", &self.config.grant_type)
            .append_pair("client_id", &self.config.client_id)
            .append_pair("client_secret", &self.config.client_secret)
            .finish();

        let response = self
            .upstream
            .forward_auth(
                Method::POST,
                &self.auth_path,
                &HeaderMap::new(),
                Bytes::from(form),
                Duration::from_secs(self.config.auth_timeout_secs),
            )
            .await?;

        if !response.status.is_success() {
            return Err(ProxyError::Auth(format!(
                "Identity endpoint returned {}",
                response.status
            )));
        }

        let parsed: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| ProxyError::Auth(format!("Malformed token response: {}", e)))?;

        self.metrics.token_refreshes.inc();
        info!(
            "Fetched service-account token (lifetime {}s)",
            parsed.expires_in.unwrap_or(self.config.token_lifetime_secs)
        );
        Ok(self.credential_from(parsed.access_token, parsed.expires_in))
    }

    fn credential_from(&self, token: String, expires_in: Option<u64>) -> Credential {
        let lifetime = expires_in.unwrap_or(self.config.token_lifetime_secs);
        Credential::new(token, Duration::from_secs(lifetime))
    }
}
