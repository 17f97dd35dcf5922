use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden::config::{parse_duration, StoreConfig};
use warden::telemetry::init_logging;
use warden::{
    Context, KvStore, LimiterBackend, LockBackend, LockManager, Manager, MemoryStore,
    Observability, PrometheusMetrics, RateLimiter, WardenConfig,
};

#[derive(Parser)]
#[command(name = "warden", version, about = "Rate limiting and lock coordination")]
struct Cli {
    /// YAML configuration file; WARDEN__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print collected metrics in Prometheus text format before exiting
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the effective settings
    CheckConfig,
    /// Count one request against a rate limit
    Allow(LimitArgs),
    /// Show how many requests a key has left
    Remaining(LimitArgs),
    /// Block until a lock is acquired
    Lock {
        key: String,
        #[arg(long, default_value = "30s", value_parser = duration_arg)]
        ttl: Duration,
        /// Give up after this long
        #[arg(long, value_parser = duration_arg)]
        timeout: Option<Duration>,
        /// Keep the lock until Ctrl+C, then release it
        #[arg(long)]
        hold: bool,
    },
    /// Acquire a lock only if it is free
    TryLock {
        key: String,
        #[arg(long, default_value = "30s", value_parser = duration_arg)]
        ttl: Duration,
    },
    /// Release a lock
    Unlock { key: String },
}

#[derive(Args)]
struct LimitArgs {
    key: String,
    #[arg(long, default_value_t = 10)]
    limit: u64,
    #[arg(long, default_value = "1s", value_parser = duration_arg)]
    window: Duration,
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = WardenConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Warden");

    if let Command::CheckConfig = cli.command {
        let mut shown = config.clone();
        if !shown.store.password.is_empty() {
            shown.store.password = "***".to_string();
        }
        println!("{}", serde_yaml::to_string(&shown)?);
        return Ok(());
    }

    let registry = Registry::new();
    let metrics = Arc::new(PrometheusMetrics::register(&registry)?);

    let store = open_store(&config).await?;
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });
    let ctx = Context::with_token(shutdown);

    match cli.command {
        Command::CheckConfig => {}
        Command::Allow(args) => {
            let limiter = LimiterBackend::from_config(
                &config.limiter,
                Some(store),
                Observability::with_metrics("ratelimit", metrics.clone()),
            )?;
            limiter.start().await?;
            let allowed = limiter.allow(&ctx, &args.key, args.limit, args.window).await?;
            let remaining = limiter.remaining(&ctx, &args.key, args.limit, args.window).await?;
            println!("allowed={} remaining={}", allowed, remaining);
            limiter.stop().await?;
        }
        Command::Remaining(args) => {
            let limiter = LimiterBackend::from_config(
                &config.limiter,
                Some(store),
                Observability::with_metrics("ratelimit", metrics.clone()),
            )?;
            limiter.start().await?;
            let remaining = limiter.remaining(&ctx, &args.key, args.limit, args.window).await?;
            println!("remaining={}", remaining);
            limiter.stop().await?;
        }
        Command::Lock { key, ttl, timeout, hold } => {
            let locks = lock_backend(&config, store, &metrics).await?;
            let wait = match timeout {
                Some(timeout) => ctx.child_with_timeout(timeout),
                None => ctx.child(),
            };
            locks.lock(&wait, &key, ttl).await?;
            println!("acquired {}", key);

            if hold {
                info!(key = %key, "Holding lock until shutdown");
                ctx.done().await;
                locks.unlock(&Context::background(), &key).await?;
                println!("released {}", key);
            }
            locks.stop().await?;
        }
        Command::TryLock { key, ttl } => {
            let locks = lock_backend(&config, store, &metrics).await?;
            let acquired = locks.try_lock(&ctx, &key, ttl).await?;
            println!("acquired={}", acquired);
            locks.stop().await?;
        }
        Command::Unlock { key } => {
            let locks = lock_backend(&config, store, &metrics).await?;
            locks.unlock(&ctx, &key).await?;
            println!("released {}", key);
            locks.stop().await?;
        }
    }

    if cli.metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        print!("{}", String::from_utf8_lossy(&buffer));
    }

    info!("Warden stopped");
    Ok(())
}

async fn lock_backend(
    config: &WardenConfig,
    store: Arc<dyn KvStore>,
    metrics: &Arc<PrometheusMetrics>,
) -> anyhow::Result<LockBackend> {
    let locks = LockBackend::from_config(
        &config.lock,
        Some(store),
        Observability::with_metrics("lock", metrics.clone()),
    )?;
    locks.start().await?;
    Ok(locks)
}

/// The memory store unless either subsystem is configured for redis.
async fn open_store(config: &WardenConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    let shared = config.limiter.driver == "redis" || config.lock.driver == "redis";
    if !shared {
        return Ok(Arc::new(MemoryStore::new()));
    }
    connect_shared(&config.store).await
}

#[cfg(feature = "redis-store")]
async fn connect_shared(config: &StoreConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    let store = warden::store::RedisStore::connect(config)
        .await
        .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn connect_shared(_config: &StoreConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    anyhow::bail!("the redis driver requires building with the `redis-store` feature")
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
