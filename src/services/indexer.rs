//! Facet indexer.
//!
//! Walks every sidecar in the bucket with a bounded pool of worker tasks and
//! collects the distinct values offered as filters. The finished facets are
//! published as an immutable snapshot behind a read-write lock, so readers
//! only ever see a complete pass; a pass that fails or is cancelled leaves the
//! previous snapshot in place.

use crate::{
    models::{metadata::FilterOptions, object::BucketObject},
    services::{
        cache_service::{self, Cache},
        sidecar::{self, ParsedSidecar, SidecarFields},
        storage_service::{BucketStorage, StorageError},
    },
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cache key of the persisted facets.
pub const FACETS_CACHE_KEY: &str = "metadata:options";

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("listing bucket for indexing failed: {0}")]
    Storage(#[from] StorageError),
    #[error("indexing cancelled")]
    Cancelled,
}

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    /// Number of concurrent sidecar fetches.
    pub workers: usize,
    /// Expiration of the cached facets.
    pub cache_ttl: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// A published set of facets.
#[derive(Debug, Clone, Default)]
pub struct FacetSnapshot {
    /// Incremented on every publish; 0 means nothing was published yet.
    pub generation: u64,
    pub built_at: Option<DateTime<Utc>>,
    pub options: FilterOptions,
}

/// Distinct values gathered during one pass.
#[derive(Debug, Clone, Default)]
struct FacetAccumulator {
    versions: BTreeSet<String>,
    statuses: BTreeSet<String>,
    uploaders: BTreeSet<String>,
    nodes: BTreeSet<String>,
    slot_ranges: BTreeSet<String>,
}

impl FacetAccumulator {
    fn record_location(&mut self, node: String, slot: u64) {
        self.nodes.insert(node);
        self.slot_ranges.insert(sidecar::slot_range(slot));
    }

    fn record_fields(&mut self, fields: &SidecarFields) {
        let facets = [
            (&fields.solana_version, &mut self.versions),
            (&fields.status, &mut self.statuses),
            (&fields.uploaded_by, &mut self.uploaders),
        ];
        for (value, set) in facets {
            if let Some(value) = value.as_deref().filter(|v| sidecar::is_facet_value(v)) {
                set.insert(value.to_string());
            }
        }
    }

    fn into_options(self) -> FilterOptions {
        let mut solana_versions: Vec<String> = self.versions.into_iter().collect();
        solana_versions.sort_by(|a, b| sidecar::compare_versions(a, b));
        let mut slot_ranges: Vec<String> = self.slot_ranges.into_iter().collect();
        slot_ranges.sort_by(|a, b| sidecar::compare_slot_ranges(a, b));

        FilterOptions {
            solana_versions,
            statuses: self.statuses.into_iter().collect(),
            uploaded_by: self.uploaders.into_iter().collect(),
            nodes: self.nodes.into_iter().collect(),
            slot_ranges,
        }
    }
}

/// Builds and serves the filter facets.
pub struct FacetIndexer {
    storage: Arc<dyn BucketStorage>,
    cache: Arc<dyn Cache>,
    config: IndexerConfig,
    current: RwLock<Arc<FacetSnapshot>>,
    /// Background passes started by [`spawn_reindex`](Self::spawn_reindex) and still running.
    running: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl FacetIndexer {
    pub fn new(
        storage: Arc<dyn BucketStorage>,
        cache: Arc<dyn Cache>,
        config: IndexerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            cache,
            config,
            current: RwLock::new(Arc::new(FacetSnapshot::default())),
            running: Arc::new(AtomicUsize::new(0)),
            shutdown,
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<FacetSnapshot> {
        self.current.read().clone()
    }

    /// Facets for the client.
    ///
    /// Falls back to the cache when nothing descriptive has been indexed yet,
    /// and schedules a background pass when the cache has nothing either.
    pub async fn facets(self: &Arc<Self>) -> FilterOptions {
        let snapshot = self.snapshot();
        if !snapshot.options.lacks_descriptive_facets() {
            return snapshot.options.clone();
        }

        if let Some(options) = self.cached_options().await {
            debug!("serving facets from cache");
            self.publish(options.clone());
            return options;
        }

        if self.running.load(Ordering::SeqCst) > 0 {
            debug!("no facets available yet, indexing already in progress");
        } else {
            info!("no facets available, scheduling background indexing");
            self.spawn_reindex();
        }
        snapshot.options.clone()
    }

    /// Drop the cached facets and start a fresh pass in the background.
    pub async fn request_reindex(self: &Arc<Self>) {
        info!("manual reindex requested");
        if let Err(err) = self.cache.delete(FACETS_CACHE_KEY).await {
            warn!("failed to invalidate cached facets: {}", err);
        }
        self.spawn_reindex();
    }

    /// Run [`reindex`](Self::reindex) on a background task, logging failures.
    pub fn spawn_reindex(self: &Arc<Self>) {
        let indexer = Arc::clone(self);
        let running = RunningPass::enter(&self.running);
        tokio::spawn(async move {
            let _running = running;
            if let Err(err) = indexer.reindex().await {
                error!("metadata indexing failed: {}", err);
            }
        });
    }

    /// Rebuild the facets, preferring a cached copy.
    ///
    /// Concurrent passes may duplicate work; each one publishes a complete
    /// snapshot, so the last to finish wins.
    pub async fn reindex(&self) -> IndexResult<FilterOptions> {
        info!("starting metadata indexing");

        if let Some(options) = self.cached_options().await {
            info!("loaded filter options from cache");
            self.publish(options.clone());
            return Ok(options);
        }

        let objects = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(IndexError::Cancelled),
            listed = self.storage.list("") => listed?,
        };
        let total = objects.len();
        let sidecars: Vec<BucketObject> = objects.into_iter().filter(|o| o.is_sidecar()).collect();
        info!(
            "found {} sidecar files among {} objects in {}",
            sidecars.len(),
            total,
            self.storage.location()
        );

        let options = if sidecars.is_empty() {
            warn!("no sidecar files to index, check the bucket contents and naming");
            FilterOptions::default()
        } else {
            self.collect(sidecars).await?.into_options()
        };

        self.publish(options.clone());
        self.persist(&options).await;

        info!(
            "metadata indexing complete: {} versions, {} statuses, {} uploaders, {} nodes, {} slot ranges",
            options.solana_versions.len(),
            options.statuses.len(),
            options.uploaded_by.len(),
            options.nodes.len(),
            options.slot_ranges.len()
        );
        Ok(options)
    }

    async fn collect(&self, sidecars: Vec<BucketObject>) -> IndexResult<FacetAccumulator> {
        let worker_count = self.config.workers.max(1).min(sidecars.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(sidecars)));
        let accumulator = Arc::new(Mutex::new(FacetAccumulator::default()));

        let mut workers = JoinSet::new();
        for worker in 0..worker_count {
            workers.spawn(index_worker(
                worker,
                Arc::clone(&self.storage),
                Arc::clone(&queue),
                Arc::clone(&accumulator),
                self.shutdown.clone(),
            ));
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!("indexing worker stopped abnormally: {}", err);
            }
        }

        if self.shutdown.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        let collected = accumulator.lock().clone();
        Ok(collected)
    }

    fn publish(&self, options: FilterOptions) {
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(FacetSnapshot {
            generation,
            built_at: Some(Utc::now()),
            options,
        });
    }

    async fn cached_options(&self) -> Option<FilterOptions> {
        match cache_service::get_json::<FilterOptions>(&*self.cache, FACETS_CACHE_KEY).await {
            Ok(Some(options)) => Some(options),
            Ok(None) => {
                debug!("cache miss for {}", FACETS_CACHE_KEY);
                None
            }
            Err(err) => {
                warn!("reading cached facets failed, treating as miss: {}", err);
                None
            }
        }
    }

    async fn persist(&self, options: &FilterOptions) {
        if let Err(err) =
            cache_service::set_json(&*self.cache, FACETS_CACHE_KEY, options, self.config.cache_ttl)
                .await
        {
            warn!("failed to cache facets: {}", err);
        }
    }
}

/// Counts a background pass as running until dropped.
struct RunningPass(Arc<AtomicUsize>);

impl RunningPass {
    fn enter(running: &Arc<AtomicUsize>) -> Self {
        running.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(running))
    }
}

impl Drop for RunningPass {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn index_worker(
    worker: usize,
    storage: Arc<dyn BucketStorage>,
    queue: Arc<Mutex<VecDeque<BucketObject>>>,
    accumulator: Arc<Mutex<FacetAccumulator>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = queue.lock().pop_front();
        let Some(object) = next else { break };

        let (slot, node) = sidecar::extract_slot_and_node(&object.key);
        if slot > 0 && !node.is_empty() {
            accumulator.lock().record_location(node, slot);
        }

        let fetched = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("indexing worker {} cancelled", worker);
                return;
            }
            fetched = fetch(storage.as_ref(), &object.key) => fetched,
        };
        let body = match fetched {
            Ok(body) => body,
            Err(err) => {
                warn!("skipping sidecar {}: {}", object.key, err);
                continue;
            }
        };

        match sidecar::parse(body) {
            ParsedSidecar::Opaque(_) => {
                warn!("skipping sidecar {}: not a JSON object", object.key);
            }
            parsed => {
                if let Some(fields) = parsed.fields() {
                    accumulator.lock().record_fields(fields);
                }
            }
        }
    }
}

async fn fetch(storage: &dyn BucketStorage, key: &str) -> Result<bytes::Bytes, StorageError> {
    storage.get(key).await?.bytes().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        cache_service::{MemoryCache, NullCache},
        storage_service::testing::MockStorage,
    };

    fn indexer(storage: Arc<MockStorage>, cache: Arc<dyn Cache>) -> Arc<FacetIndexer> {
        Arc::new(FacetIndexer::new(
            storage,
            cache,
            IndexerConfig {
                workers: 3,
                ..Default::default()
            },
            CancellationToken::new(),
        ))
    }

    fn populated_storage() -> Arc<MockStorage> {
        let storage = Arc::new(MockStorage::new());
        storage.put(
            "snapshot-1500000-NodeA.json",
            r#"{"solana_version":"1.10.0","status":"complete","uploaded_by":"ops"}"#,
        );
        storage.put(
            "snapshot-500-NodeB.json",
            r#"{"solana_version":"1.9.0","status":"unknown","uploaded_by":"ci"}"#,
        );
        storage.put(
            "snapshot-12000000-NodeA.json",
            r#"{"solana_version":"1.2.0","status":3,"uploaded_by":"ops"}"#,
        );
        storage.put("snapshot-2000000-NodeC.json", "garbage");
        storage.put("snapshot-1500000-NodeA.tar.gz", "archive bytes");
        storage.put("notes.json", r#"{"solana_version":"9.9.9"}"#);
        storage
    }

    #[tokio::test]
    async fn builds_sorted_facets() {
        let storage = populated_storage();
        let indexer = indexer(storage.clone(), Arc::new(NullCache));

        let options = indexer.reindex().await.unwrap();
        assert_eq!(options.solana_versions, ["1.2.0", "1.9.0", "1.10.0"]);
        assert_eq!(options.statuses, ["complete"]);
        assert_eq!(options.uploaded_by, ["ci", "ops"]);
        assert_eq!(options.nodes, ["NodeA", "NodeB", "NodeC"]);
        assert_eq!(options.slot_ranges, ["< 1M", "1M-2M", "2M-3M", "12M-13M"]);

        let snapshot = indexer.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.options, options);
    }

    #[tokio::test]
    async fn empty_bucket_is_cached_as_empty_facets() {
        let storage = Arc::new(MockStorage::new());
        storage.put("readme.txt", "hi");
        let indexer = indexer(storage.clone(), Arc::new(MemoryCache::new()));

        let first = indexer.reindex().await.unwrap();
        assert!(first.is_empty());
        assert_eq!(storage.list_count(), 1);

        let second = indexer.reindex().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(storage.list_count(), 1, "second pass must come from cache");
    }

    #[tokio::test]
    async fn cache_hit_skips_listing() {
        let storage = populated_storage();
        let cache = Arc::new(MemoryCache::new());
        let cached = FilterOptions {
            statuses: vec!["from-cache".into()],
            ..Default::default()
        };
        cache_service::set_json(&*cache, FACETS_CACHE_KEY, &cached, Duration::from_secs(60))
            .await
            .unwrap();

        let indexer = indexer(storage.clone(), cache);
        assert_eq!(indexer.reindex().await.unwrap(), cached);
        assert_eq!(storage.list_count(), 0);
        assert_eq!(indexer.snapshot().options, cached);
    }

    #[tokio::test]
    async fn failed_listing_keeps_previous_facets() {
        let storage = populated_storage();
        let indexer = indexer(storage.clone(), Arc::new(NullCache));
        let good = indexer.reindex().await.unwrap();

        storage.fail_listing(true);
        let err = indexer.reindex().await.unwrap_err();
        assert!(matches!(err, IndexError::Storage(_)));
        assert_eq!(indexer.snapshot().options, good);
        assert_eq!(indexer.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn cancelled_pass_does_not_publish() {
        let storage = populated_storage();
        let shutdown = CancellationToken::new();
        let indexer = FacetIndexer::new(
            storage,
            Arc::new(NullCache),
            IndexerConfig::default(),
            shutdown.clone(),
        );
        shutdown.cancel();

        assert!(matches!(indexer.reindex().await, Err(IndexError::Cancelled)));
        assert_eq!(indexer.snapshot().generation, 0);
    }

    #[tokio::test]
    async fn unreadable_sidecar_is_skipped() {
        let storage = populated_storage();
        storage.fail_get("snapshot-500-NodeB.json");
        let indexer = indexer(storage.clone(), Arc::new(NullCache));

        let options = indexer.reindex().await.unwrap();
        assert_eq!(options.solana_versions, ["1.2.0", "1.10.0"]);
        assert_eq!(options.uploaded_by, ["ops"]);
        // Location facets come from the name, so they survive a failed fetch.
        assert_eq!(options.nodes, ["NodeA", "NodeB", "NodeC"]);
        assert_eq!(options.slot_ranges, ["< 1M", "1M-2M", "2M-3M", "12M-13M"]);
        assert_eq!(indexer.snapshot().generation, 1);
    }

    #[tokio::test]
    async fn cancelling_while_workers_fetch_does_not_publish() {
        let storage = populated_storage();
        let gate = storage.hold_gets();
        let shutdown = CancellationToken::new();
        let indexer = Arc::new(FacetIndexer::new(
            storage.clone(),
            Arc::new(NullCache),
            IndexerConfig {
                workers: 2,
                ..Default::default()
            },
            shutdown.clone(),
        ));

        let pass = tokio::spawn({
            let indexer = Arc::clone(&indexer);
            async move { indexer.reindex().await }
        });
        for _ in 0..100 {
            if storage.get_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(storage.get_count() > 0, "workers never started fetching");

        shutdown.cancel();
        let result = pass.await.unwrap();
        assert!(matches!(result, Err(IndexError::Cancelled)), "{result:?}");
        assert_eq!(indexer.snapshot().generation, 0);
        assert!(indexer.snapshot().options.is_empty());
        gate.close();
    }

    #[tokio::test]
    async fn facets_fall_back_to_cache_then_schedule_indexing() {
        let storage = populated_storage();
        let cache = Arc::new(MemoryCache::new());
        let indexer = indexer(storage.clone(), cache.clone());

        let options = indexer.facets().await;
        assert!(options.is_empty());

        for _ in 0..100 {
            if indexer.snapshot().generation > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let options = indexer.facets().await;
        assert_eq!(options.solana_versions, ["1.2.0", "1.9.0", "1.10.0"]);
    }

    #[test]
    fn generations_never_go_backwards_under_concurrent_publishes() {
        let indexer = Arc::new(FacetIndexer::new(
            Arc::new(MockStorage::new()),
            Arc::new(NullCache),
            IndexerConfig::default(),
            CancellationToken::new(),
        ));
        let publishers: Vec<_> = (0..8)
            .map(|_| {
                let indexer = Arc::clone(&indexer);
                std::thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..50 {
                        indexer.publish(FilterOptions::default());
                        let seen = indexer.snapshot().generation;
                        assert!(seen > last, "generation went from {last} to {seen}");
                        last = seen;
                    }
                })
            })
            .collect();
        for publisher in publishers {
            publisher.join().unwrap();
        }
        assert_eq!(indexer.snapshot().generation, 400);
    }

    #[tokio::test]
    async fn burst_of_facet_requests_starts_one_pass() {
        let storage = populated_storage();
        let gate = storage.hold_gets();
        let indexer = indexer(storage.clone(), Arc::new(NullCache));

        for _ in 0..5 {
            assert!(indexer.facets().await.is_empty());
        }
        for _ in 0..100 {
            if storage.get_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(storage.list_count(), 1);

        gate.close();
        for _ in 0..100 {
            if indexer.snapshot().generation > 0 && indexer.running.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(indexer.snapshot().generation, 1);
        assert_eq!(indexer.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_passes_agree() {
        let storage = populated_storage();
        let indexer = indexer(storage, Arc::new(NullCache));
        let (a, b) = tokio::join!(indexer.reindex(), indexer.reindex());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(indexer.snapshot().generation, 2);
    }
}
