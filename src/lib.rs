pub mod config;
pub mod routes;
pub mod cache;
pub mod proxy;
pub mod upstream;
pub mod credentials;
pub mod retry;
pub mod error;
pub mod logging;
pub mod common;
pub mod secret_store;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::ProxyServer;
