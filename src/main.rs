use anyhow::{Context, Result};
use clap::Parser;
use corridor_bridge::config::Config;
use corridor_bridge::logging;
use corridor_bridge::proxy::ProxyServer;
use corridor_bridge::secret_store::{self, SecretStore};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;
use tokio::sync::oneshot;

#[derive(Parser)]
#[clap(
    version = "0.4.1",
    author = "Corridor Bridge",
    about = "Authenticated caching proxy for a remittance sandbox API"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 0.0.0.0:3001)")]
    listen: Option<String>,

    #[clap(long, value_name = "HOST", help = "Upstream sandbox host")]
    upstream_host: Option<String>,

    #[clap(long, value_name = "PORT", help = "Upstream sandbox port")]
    upstream_port: Option<u16>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn or error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, help = "Fetch a bearer token at startup instead of on first use")]
    warm: bool,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, help = "Initialize key material for encrypted configuration values")]
    init_secret_key: bool,

    #[clap(long, help = "Overwrite existing key material (with --init-secret-key)")]
    force: bool,

    #[clap(long, value_name = "VALUE", help = "Seal VALUE for use in the configuration file and exit")]
    encrypt_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle one-shot actions before any server setup
    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    if args.init_secret_key {
        let store = SecretStore::new()?;
        store.init_key(args.force)?;
        println!("Secret key initialized.");
        return Ok(());
    }

    if let Some(value) = args.encrypt_secret {
        let store = SecretStore::new()?;
        println!("{}", store.seal(&value)?);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("Configuration file not found: {}", config_file);
        }
        Config::from_file(config_file).with_context(|| format!("Failed to load {}", config_file))?
    } else {
        Config::default()
    };

    config.apply_env_overrides()?;
    apply_cli_overrides(&mut config, &args)?;

    logging::init(&config.logging);

    if secret_store::config_has_encrypted_values(&config) {
        let store = SecretStore::new().context("Secret store unavailable")?;
        store
            .apply_to_config(&mut config)
            .context("Failed to unseal encrypted configuration values")?;
    }

    config.apply_defaults();
    config.validate()?;

    info!("Starting sandbox proxy...");
    let server = ProxyServer::bind(&config).await?;
    info!("Listening on {}", server.local_addr()?);
    info!("Forwarding to {}", config.upstream_origin());

    if config.credentials.eager_fetch {
        if let Err(e) = server.warm_credentials().await {
            warn!("Credential warm-up failed, continuing without a cached token: {}", e);
        }
    }

    let sweeper = server.spawn_cache_sweeper();

    // Create a shutdown signal
    let (_shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    // Spawn the server in a task
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            eprintln!("Server error: {}", e);
        }
    });

    // Wait for Ctrl+C signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("\n🛑 Received Ctrl+C, shutting down gracefully...");
        }
        _ = &mut shutdown_rx => {
            info!("🛑 Shutdown signal received, shutting down gracefully...");
        }
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Server task error: {}", e);
            }
        }
    }

    sweeper.abort();
    info!("👋 Proxy server stopped. Goodbye!");
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(listen) = &args.listen {
        let addr: SocketAddr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
        config.listen_host = addr.ip().to_string();
        config.listen_port = addr.port();
    }
    if let Some(host) = &args.upstream_host {
        config.upstream.host = host.clone();
    }
    if let Some(port) = args.upstream_port {
        config.upstream.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = logging::parse_level(level)?;
    }
    if let Some(format) = &args.log_format {
        config.logging.format = logging::parse_format(format)?;
    }
    if args.warm {
        config.credentials.eager_fetch = true;
    }
    Ok(())
}

/// Writes a starter configuration with the full default route table so
/// operators can see and tune every policy knob.
fn generate_sample_config(file_path: &str) -> Result<()> {
    let mut sample = Config::default();
    sample.upstream.host = "api.sandbox.example.com".to_string();
    sample.credentials.username = "CHANGE_ME".to_string();
    sample.credentials.password = "CHANGE_ME".to_string();
    sample.credentials.client_id = "CHANGE_ME".to_string();
    sample.credentials.client_secret = "CHANGE_ME".to_string();
    sample.partner.sender = "CHANGE_ME".to_string();
    sample.partner.company = "CHANGE_ME".to_string();
    sample.partner.branch = "CHANGE_ME".to_string();
    sample.apply_defaults();
    sample.to_file(file_path)?;
    Ok(())
}
