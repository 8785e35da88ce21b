//! Shared application state handed to every handler.

use crate::{
    config::AppConfig,
    services::{
        cache_service::Cache,
        hub::{Hub, HubHandle, ListingPoller},
        indexer::{FacetIndexer, IndexerConfig},
        storage_service::BucketStorage,
    },
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Timing of the per-connection push pumps.
#[derive(Debug, Clone, Copy)]
pub struct PushTiming {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn BucketStorage>,
    pub cache: Arc<dyn Cache>,
    pub indexer: Arc<FacetIndexer>,
    pub hub: HubHandle,
    pub push: PushTiming,
    /// Sidecar fetches in flight per metadata listing.
    pub query_concurrency: usize,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the services together and start the background tasks: the hub
    /// control loop, the listing poller and an initial indexing pass.
    ///
    /// Every task stops when `shutdown` is cancelled.
    pub fn start(
        storage: Arc<dyn BucketStorage>,
        cache: Arc<dyn Cache>,
        cfg: &AppConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let indexer = Arc::new(FacetIndexer::new(
            storage.clone(),
            cache.clone(),
            IndexerConfig {
                workers: cfg.indexer.workers,
                cache_ttl: cfg.cache_ttl(),
            },
            shutdown.clone(),
        ));

        let (hub, handle) = Hub::new(cfg.hub.client_queue);
        tokio::spawn(hub.run(shutdown.clone()));

        let poller = ListingPoller::new(storage.clone(), handle.clone(), cfg.hub.poll_interval());
        tokio::spawn(poller.run(shutdown.clone()));

        info!(
            "serving {} with {} cache, {} index workers",
            storage.location(),
            cache.name(),
            cfg.indexer.workers
        );
        indexer.spawn_reindex();

        Self {
            storage,
            cache,
            indexer,
            hub: handle,
            push: PushTiming {
                write_wait: cfg.hub.write_wait(),
                pong_wait: cfg.hub.pong_wait(),
                ping_period: cfg.hub.ping_period(),
            },
            query_concurrency: cfg.indexer.workers,
            shutdown,
        }
    }
}
