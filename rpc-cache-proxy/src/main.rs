//! Entrypoint: parse CLI/env/file config, build the store/upstream
//! client/pipeline, serve HTTP, and shut down cleanly on signal. Mirrors the
//! teacher's startup shape (`tracing_subscriber` env-filter init, `argh`
//! for the CLI, an `anyhow::Result<()>` `main`) without the multi-service
//! bring-up (`app.rs::spawn` brings up Redis, web3 providers, stats, influx,
//! etc. all at once) this proxy does not need.

use anyhow::Context;
use cache_store::{CacheStore, MemoryStore, RedisStore};
use rpc_cache_proxy::config::{AppConfig, CacheType, CliArgs};
use rpc_cache_proxy::pipeline::Pipeline;
use rpc_cache_proxy::upstream::UpstreamClient;
use rpc_cache_proxy::frontend;
use std::sync::Arc;
use tracing::{info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Builds the configured cache backend. `CacheType::Auto`/`Redis` try Redis
/// first and fall back to the in-process store on a connection failure,
/// per the proxy's "never fail startup over a cache backend" rule; only an
/// explicit `CacheType::Redis` with no `REDIS_URL` at all is an error.
async fn build_store(config: &AppConfig) -> anyhow::Result<(Arc<dyn CacheStore>, bool)> {
    match (config.cache_type, &config.redis_url) {
        (CacheType::Memory, _) => Ok((Arc::new(MemoryStore::default()), false)),
        (CacheType::Redis, None) => {
            Err(anyhow::anyhow!("CACHE_TYPE=redis requires REDIS_URL to be set"))
        }
        (CacheType::Redis, Some(url)) => {
            let store = RedisStore::connect(url).await.context("connecting to redis")?;
            Ok((Arc::new(store), true))
        }
        (CacheType::Auto, None) => Ok((Arc::new(MemoryStore::default()), false)),
        (CacheType::Auto, Some(url)) => match RedisStore::connect(url).await {
            Ok(store) => Ok((Arc::new(store), true)),
            Err(err) => {
                warn!(%err, "redis unavailable, falling back to the in-process cache");
                Ok((Arc::new(MemoryStore::default()), false))
            }
        },
    }
}

async fn shutdown_signal(pipeline: Arc<Pipeline>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, releasing held locks");
    pipeline.release_held_locks().await;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli: CliArgs = argh::from_env();
    let config = AppConfig::load(&cli).context("loading configuration")?;

    if config.upstream_urls.is_empty() {
        anyhow::bail!("UPSTREAM_RPC_URL must name at least one upstream");
    }

    let (store, store_supports_cross_instance) = build_store(&config).await?;
    info!(backend = store.backend_name(), "cache store ready");

    let upstream = UpstreamClient::new(config.upstream_urls.clone(), config.rpc_max_retries_per_url)
        .context("building upstream client")?;

    let addr = std::net::SocketAddr::from((config.host, config.port));
    let pipeline = Arc::new(Pipeline::new(
        config,
        store,
        store_supports_cross_instance,
        upstream,
    ));

    let app = frontend::router(pipeline.clone());

    info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(pipeline))
        .await
        .context("server error")?;

    Ok(())
}
