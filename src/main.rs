use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, StoreBackend, TurnstileConfig};
use turnstile::http::{AdmissionState, HttpServer};
use turnstile::ratelimit::{parse_token_overrides, DecisionEngine, RuleResolver};
use turnstile::store::{CounterStore, MemoryStore, RedisStore};

/// Distributed request admission controller.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Token overrides as token:limit:block[,token:limit:block...]
    #[arg(long)]
    token_overrides: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.listen {
        config.server.listen_addr = addr;
    }
    if let Some(raw) = args.token_overrides.as_deref() {
        config
            .rate_limiting
            .token_overrides
            .extend(parse_token_overrides(raw)?);
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile admission controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        instance_id = %config.server.instance_id,
        listen_addr = %config.server.listen_addr,
        limit_per_second = config.rate_limiting.limit_per_second,
        block_seconds = config.rate_limiting.block_seconds,
        overrides = config.rate_limiting.token_overrides.len(),
        store = ?config.store.backend,
        "Configuration loaded"
    );

    let resolver = Arc::new(RuleResolver::new(&config.rate_limiting)?);
    info!(mode = ?resolver.mode(), "Rule resolver initialized");
    let store = connect_store(&config).await?;
    let engine = Arc::new(DecisionEngine::new(store));
    info!("Decision engine initialized");

    let server = HttpServer::new(config.server.listen_addr, AdmissionState::new(resolver, engine));
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile admission controller stopped");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Build the configured counter store.
async fn connect_store(config: &TurnstileConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.store.backend {
        StoreBackend::Redis => {
            let store =
                RedisStore::connect_with_config(config.store.connection_info()?, config.store.redis())
                    .await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::with_prefix(&config.store.key_prefix));
            spawn_sweeper(store.clone(), Duration::from_secs(config.store.sweep_interval_secs.max(1)));
            info!("Using in-process store; limits apply to this instance only");
            Ok(store)
        }
    }
}

/// Periodically drop expired entries from the in-process store.
fn spawn_sweeper(store: Arc<MemoryStore>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            store.purge_expired();
        }
    });
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
