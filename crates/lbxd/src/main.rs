//! lbxd: lockbox server daemon
//!
//! Usage:
//!   lbxd [--config /etc/lbxd/lbxd.toml] [--log info] [--log-format json|text]
//!
//! The session token secret comes from `auth.token_secret` or, preferably,
//! the LBXD_TOKEN_SECRET environment variable.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lbx_core::config::ServerConfig;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lbxd", version, about = "Lockbox vault server")]
struct Cli {
    /// Path to lbxd.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LBXD_CONFIG",
        default_value = "/etc/lbxd/lbxd.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, env = "LBXD_LOG")]
    log: Option<String>,

    /// Log format; overrides the config file
    #[arg(long, env = "LBXD_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// HMAC secret for session tokens (at least 16 bytes)
    #[arg(long, env = "LBXD_TOKEN_SECRET", hide_env_values = true)]
    token_secret: Option<String>,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, found) = load_config(&cli.config).await?;
    if let Some(secret) = cli.token_secret {
        config.auth.token_secret = Some(secret);
    }

    let level = cli.log.unwrap_or_else(|| config.server.log_level.clone());
    let format = cli.log_format.unwrap_or(match config.server.log_format.as_str() {
        "text" => LogFormat::Text,
        _ => LogFormat::Json,
    });
    init_logging(&level, &format);

    if !found {
        tracing::warn!(
            "config file not found: {}  (using defaults)",
            cli.config.display()
        );
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        listen = %config.server.listen,
        "lbxd starting"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    lbxd::daemon::run(config, shutdown).await
}

async fn load_config(path: &Path) -> Result<(ServerConfig, bool)> {
    if !path.exists() {
        return Ok((ServerConfig::default(), false));
    }
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading config {}", path.display()))?;
    let config = toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok((config, true))
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                }
            }
            Err(e) => {
                tracing::warn!("registering SIGTERM handler failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received Ctrl-C");
    }
    shutdown.cancel();
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
