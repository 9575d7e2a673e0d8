use crate::config::{LogFormat, LogLevel, LoggingConfig};
use crate::error::ProxyError;
use chrono::Utc;
use serde_json::json;
use std::io::Write;

/// Initialize the global logger. `RUST_LOG` still wins over the configured
/// level so verbosity can be raised without touching the config file.
pub fn init(config: &LoggingConfig) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.level.to_string()),
    );

    match config.format {
        LogFormat::Json => {
            builder.format(|buf, record| {
                let entry = json!({
                    "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", entry)
            });
        }
        LogFormat::Text => {
            builder.format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] [{}] {}",
                    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.target(),
                    record.args()
                )
            });
        }
    }

    // Tests and embedded callers may initialize more than once.
    let _ = builder.try_init();
}

pub fn parse_level(s: &str) -> Result<LogLevel, ProxyError> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(ProxyError::Config(format!(
            "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            s
        ))),
    }
}

pub fn parse_format(s: &str) -> Result<LogFormat, ProxyError> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(ProxyError::Config(format!(
            "Invalid log format: {}. Must be one of: text, json",
            s
        ))),
    }
}
