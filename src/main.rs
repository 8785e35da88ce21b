use anyhow::{Context, Result};
use snapshot_browser::{
    config::{AppConfig, CacheBackend, StorageBackend},
    services::{
        cache_service::{Cache, MemoryCache, NullCache, SqliteCache},
        storage_service::{BucketStorage, StorageService},
    },
    state::AppState,
};
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting snapshot-browser with config: {:?}", cfg);

    // --- Handle migration mode ---
    if migrate {
        let cache = SqliteCache::connect(&cfg.cache.database_url)
            .await
            .with_context(|| format!("migrating cache at {}", cfg.cache.database_url))?;
        let purged = cache
            .purge_expired()
            .await
            .context("purging expired cache entries")?;
        tracing::info!("Cache migration complete, {} expired entries purged.", purged);
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let storage: Arc<dyn BucketStorage> = Arc::new(match cfg.storage.backend {
        StorageBackend::S3 => StorageService::s3(&cfg.s3).context("configuring S3 storage")?,
        StorageBackend::Local => {
            StorageService::local(&cfg.storage.root).context("opening local storage")?
        }
    });
    let cache = connect_cache(&cfg).await;

    let shutdown = CancellationToken::new();
    let state = AppState::start(storage, cache, &cfg, shutdown.clone());

    // --- Build router ---
    let app = snapshot_browser::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.server.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.server.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Build the configured cache; a cache that cannot be opened is replaced by
/// `NullCache` so the service still starts.
async fn connect_cache(cfg: &AppConfig) -> Arc<dyn Cache> {
    match cfg.cache.backend {
        CacheBackend::Sqlite => match SqliteCache::connect(&cfg.cache.database_url).await {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                tracing::warn!(
                    "Failed to open cache at {}: {}. Continuing without cache",
                    cfg.cache.database_url,
                    err
                );
                Arc::new(NullCache)
            }
        },
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::None => Arc::new(NullCache),
    }
}

/// Resolve on Ctrl-C and stop the background tasks.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
    shutdown.cancel();
}
