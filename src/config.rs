use crate::error::ProxyError;
use crate::routes::RouteRule;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_upstream_port() -> u16 {
    443
}

fn default_use_tls() -> bool {
    true
}

fn default_auth_path() -> String {
    "/auth/realms/cdp/protocol/openid-connect/token".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

/// Where forwarded requests go. The host carries no default on purpose:
/// deployments must supply it via config file, `CORRIDOR_UPSTREAM_HOST` or
/// the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(default = "default_auth_path")]
    pub auth_path: String,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_upstream_port(),
            use_tls: default_use_tls(),
            auth_path: default_auth_path(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

fn default_grant_type() -> String {
    "password".to_string()
}

fn default_token_lifetime() -> u64 {
    300
}

fn default_safety_margin() -> u64 {
    60
}

fn default_auth_timeout() -> u64 {
    30
}

/// Service-account grant used against the identity endpoint. Credentials are
/// never baked into the binary; `password` and `client_secret` may carry
/// `{encrypted}` payloads handled by the secret store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_grant_type")]
    pub grant_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_token_lifetime")]
    pub token_lifetime_secs: u64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default)]
    pub eager_fetch: bool,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            grant_type: default_grant_type(),
            client_id: String::new(),
            client_secret: String::new(),
            token_lifetime_secs: default_token_lifetime(),
            safety_margin_secs: default_safety_margin(),
            auth_timeout_secs: default_auth_timeout(),
            eager_fetch: false,
        }
    }
}

fn default_channel() -> String {
    "Direct".to_string()
}

/// Partner identification headers injected when the inbound request does not
/// carry them. Empty values are never injected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerDefaults {
    #[serde(default)]
    pub sender: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub branch: String,
}

impl Default for PartnerDefaults {
    fn default() -> Self {
        Self {
            sender: String::new(),
            channel: default_channel(),
            company: String::new(),
            branch: String::new(),
        }
    }
}

impl PartnerDefaults {
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            ("sender", self.sender.as_str()),
            ("channel", self.channel.as_str()),
            ("company", self.company.as_str()),
            ("branch", self.branch.as_str()),
        ]
    }
}

fn default_sweep_interval() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3001
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialConfig,
    #[serde(default)]
    pub partner: PartnerDefaults,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Route policy table. Left empty, `apply_defaults` installs the standard
    /// sandbox table.
    #[serde(default)]
    pub routes: Vec<RouteRule>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            upstream: UpstreamConfig::default(),
            credentials: CredentialConfig::default(),
            partner: PartnerDefaults::default(),
            cache: CacheConfig::default(),
            max_body_bytes: default_max_body_bytes(),
            routes: Vec::new(),
            logging: LoggingConfig::default(),
        }
    }
}

const ENV_LISTEN_HOST: &str = "CORRIDOR_LISTEN_HOST";
const ENV_LISTEN_PORT: &str = "CORRIDOR_LISTEN_PORT";
const ENV_UPSTREAM_HOST: &str = "CORRIDOR_UPSTREAM_HOST";
const ENV_UPSTREAM_PORT: &str = "CORRIDOR_UPSTREAM_PORT";
const ENV_AUTH_USERNAME: &str = "CORRIDOR_AUTH_USERNAME";
const ENV_AUTH_PASSWORD: &str = "CORRIDOR_AUTH_PASSWORD";
const ENV_CLIENT_ID: &str = "CORRIDOR_CLIENT_ID";
const ENV_CLIENT_SECRET: &str = "CORRIDOR_CLIENT_SECRET";

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file '{path}': {e}")))?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Cannot serialize configuration: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Environment variables win over the config file but lose to CLI flags.
    pub fn apply_env_overrides(&mut self) -> Result<(), ProxyError> {
        if let Ok(host) = std::env::var(ENV_LISTEN_HOST) {
            self.listen_host = host;
        }
        if let Ok(port) = std::env::var(ENV_LISTEN_PORT) {
            self.listen_port = port
                .parse()
                .map_err(|_| ProxyError::Config(format!("{ENV_LISTEN_PORT} is not a port: {port}")))?;
        }
        if let Ok(host) = std::env::var(ENV_UPSTREAM_HOST) {
            self.upstream.host = host;
        }
        if let Ok(port) = std::env::var(ENV_UPSTREAM_PORT) {
            self.upstream.port = port
                .parse()
                .map_err(|_| ProxyError::Config(format!("{ENV_UPSTREAM_PORT} is not a port: {port}")))?;
        }
        if let Ok(username) = std::env::var(ENV_AUTH_USERNAME) {
            self.credentials.username = username;
        }
        if let Ok(password) = std::env::var(ENV_AUTH_PASSWORD) {
            self.credentials.password = password;
        }
        if let Ok(client_id) = std::env::var(ENV_CLIENT_ID) {
            self.credentials.client_id = client_id;
        }
        if let Ok(client_secret) = std::env::var(ENV_CLIENT_SECRET) {
            self.credentials.client_secret = client_secret;
        }
        Ok(())
    }

    /// Installs the default route table when the config supplies none.
    pub fn apply_defaults(&mut self) {
        if self.routes.is_empty() {
            self.routes = RouteRule::default_table(&self.upstream.auth_path);
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.upstream.host.is_empty() {
            return Err(ProxyError::Config(format!(
                "Upstream host is not configured (set upstream.host or {ENV_UPSTREAM_HOST})"
            )));
        }
        url::Url::parse(&self.upstream_origin())?;
        if self.credentials.username.is_empty() || self.credentials.password.is_empty() {
            return Err(ProxyError::Config(format!(
                "Service-account credentials are not configured (set credentials.username/password or {ENV_AUTH_USERNAME}/{ENV_AUTH_PASSWORD})"
            )));
        }
        if self.credentials.client_id.is_empty() || self.credentials.client_secret.is_empty() {
            return Err(ProxyError::Config(format!(
                "Identity client is not configured (set credentials.client_id/client_secret or {ENV_CLIENT_ID}/{ENV_CLIENT_SECRET})"
            )));
        }
        if self.routes.is_empty() {
            return Err(ProxyError::Config(
                "Route table is empty; call apply_defaults or configure routes".to_string(),
            ));
        }
        for rule in &self.routes {
            rule.validate()?;
        }
        if self.max_body_bytes == 0 {
            return Err(ProxyError::Config(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ProxyError::Config(
                "cache.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ProxyError> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|e| {
                ProxyError::Config(format!(
                    "Invalid listen address {}:{}: {}",
                    self.listen_host, self.listen_port, e
                ))
            })
    }

    /// `scheme://host:port` used for every upstream URI.
    pub fn upstream_origin(&self) -> String {
        let scheme = if self.upstream.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.upstream.host, self.upstream.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn configured() -> Config {
        let mut config = Config::default();
        config.upstream.host = "upstream.example.test".to_string();
        config.credentials.username = "svc-user".to_string();
        config.credentials.password = "svc-pass".to_string();
        config.credentials.client_id = "svc-client".to_string();
        config.credentials.client_secret = "svc-secret".to_string();
        config.apply_defaults();
        config
    }

    #[test]
    fn defaults_deserialize_from_empty_document() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_host, "0.0.0.0");
        assert_eq!(config.listen_port, 3001);
        assert_eq!(config.upstream.port, 443);
        assert!(config.upstream.use_tls);
        assert_eq!(config.credentials.token_lifetime_secs, 300);
        assert_eq!(config.credentials.safety_margin_secs, 60);
        assert_eq!(config.cache.sweep_interval_secs, 600);
        assert_eq!(config.partner.channel, "Direct");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"listen_port": 4100, "upstream": {{"host": "upstream.example.test", "use_tls": false, "port": 8443}}}}"#
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.listen_port, 4100);
        assert_eq!(config.upstream.host, "upstream.example.test");
        assert_eq!(config.upstream_origin(), "http://upstream.example.test:8443");
    }

    #[test]
    fn from_file_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = Config::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn validate_requires_upstream_host_and_credentials() {
        let mut config = Config::default();
        config.apply_defaults();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CORRIDOR_UPSTREAM_HOST"));

        config.upstream.host = "upstream.example.test".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("CORRIDOR_AUTH_USERNAME"));

        let config = configured();
        config.validate().unwrap();
    }

    #[test]
    fn apply_defaults_installs_route_table_once() {
        let mut config = configured();
        let count = config.routes.len();
        assert!(count > 0);

        // A second call must not clobber a populated table.
        config.routes.truncate(1);
        config.apply_defaults();
        assert_eq!(config.routes.len(), 1);
    }

    // Environment mutation lives in a single test so parallel test threads
    // never observe each other's variables.
    #[test]
    fn env_overrides_take_effect() {
        let mut config = configured();
        unsafe {
            std::env::set_var(ENV_UPSTREAM_HOST, "override.example.test");
            std::env::set_var(ENV_LISTEN_PORT, "4999");
        }
        config.apply_env_overrides().unwrap();
        unsafe {
            std::env::remove_var(ENV_UPSTREAM_HOST);
            std::env::remove_var(ENV_LISTEN_PORT);
        }
        assert_eq!(config.upstream.host, "override.example.test");
        assert_eq!(config.listen_port, 4999);

        unsafe {
            std::env::set_var(ENV_UPSTREAM_PORT, "not-a-port");
        }
        let result = config.apply_env_overrides();
        unsafe {
            std::env::remove_var(ENV_UPSTREAM_PORT);
        }
        assert!(result.is_err());
    }

    #[test]
    fn listen_addr_parses_host_and_port() {
        let mut config = configured();
        config.listen_host = "127.0.0.1".to_string();
        config.listen_port = 0;
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
    }
}
