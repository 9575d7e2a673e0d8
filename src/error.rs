use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Hyper error: {0}")]
    Hyper(String),

    #[error("URI error: {0}")]
    Uri(String),

    #[error("Upstream unavailable after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
}

impl ProxyError {
    /// Transport-level faults never reached the upstream application and are
    /// the only errors the retry loop is allowed to absorb.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProxyError::Io(_) | ProxyError::Connection(_) | ProxyError::Hyper(_)
        )
    }
}
