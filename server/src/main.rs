use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use updraft_server::{Api, App, AppConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Updraft crash-game coordination server", long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// Path to the sqlite store.
    #[arg(long, default_value = "updraft.db", env = "STORE_PATH")]
    store_path: PathBuf,

    /// Weighted crash-band config, read once at startup.
    #[arg(long, default_value = "multiplierConfig.json")]
    multiplier_config: PathBuf,

    /// Round countdown config; runtime changes are written back debounced.
    #[arg(long, default_value = "gameCountdownConfig.json")]
    countdown_config: PathBuf,

    /// HTTP rate limit per IP in requests per second (0 disables).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }
    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing();
    ensure_production_env()?;

    let defaults = AppConfig::default();
    let config = AppConfig {
        store_path: args.store_path,
        multiplier_config_path: args.multiplier_config,
        countdown_config_path: args.countdown_config,
        http_rate_limit_per_second: match args.http_rate_limit_per_second {
            Some(0) => None,
            Some(value) => Some(value),
            None => defaults.http_rate_limit_per_second,
        },
        http_rate_limit_burst: match args.http_rate_limit_burst {
            Some(0) => None,
            Some(value) => Some(value),
            None => defaults.http_rate_limit_burst,
        },
        http_body_limit_bytes: match args.http_body_limit_bytes {
            Some(0) => None,
            Some(value) => Some(value),
            None => defaults.http_body_limit_bytes,
        },
    };

    // A store that cannot open is fatal; everything else degrades.
    let app = Arc::new(App::new(config).context("initialize core")?);
    app.start();

    let api = Api::new(Arc::clone(&app));
    let router = api.router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);

    let shutdown_app = Arc::clone(&app);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Shutdown signal received; flushing state");
        shutdown_app.shutdown().await;
    })
    .await
    .context("axum server error")?;

    Ok(())
}
