//! Read-through cache facade
//!
//! Lookups go through three layers:
//! - the local shard owning the key (fastest, source of truth)
//! - the optional distributed store (shared across instances)
//! - the origin fetch function supplied by the caller
//!
//! Entries are refreshed in the background once they pass their randomized
//! `refresh_after` deadline, and synchronously once they pass `expires_at`.
//! Concurrent fetches for the same key are coalesced into one origin call.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, FetchResult};
use crate::distributed::{DistributedLayer, Record};
use crate::entry::{Freshness, Hit, Lifetime};
use crate::error::BoxError;
use crate::router::KeyRouter;
use crate::shard::Shard;
use crate::{CacheConfig, CacheError, DistributedStore, EarlyRefreshConfig};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Type-erased batch fetch function kept while refreshes are buffered.
type BatchFetch<V> =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<HashMap<String, V>, CacheError>> + Send + Sync>;

/// Background refreshes waiting to be flushed as one batch call
struct PendingRefresh<V> {
    generation: u64,
    keys: Vec<String>,
    /// Fetch function of the first caller in this buffer cycle
    fetch: BatchFetch<V>,
}

/// Who a load is running for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// A caller is blocked on the result.
    Foreground,
    /// Early refresh of an entry that is still being served.
    Background,
}

/// Sharded read-through cache for values of type `V`.
///
/// Cheap to clone; clones share the same storage.
pub struct Cache<V: Cacheable> {
    inner: Arc<CacheInner<V>>,
}

struct CacheInner<V: Cacheable> {
    name: String,
    config: CacheConfig,
    router: KeyRouter,
    shards: Vec<Mutex<Shard<V>>>,
    coordinator: Coordinator<V>,
    distributed: Option<DistributedLayer>,
    refresh_buffer: Mutex<Option<PendingRefresh<V>>>,
    buffer_generation: AtomicU64,
}

impl<V: Cacheable> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable> Cache<V> {
    /// Create a local-only cache.
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Result<Self, CacheError> {
        Self::build(name.into(), config, None)
    }

    /// Create a cache backed by a distributed store.
    pub fn with_distributed_store(
        name: impl Into<String>,
        config: CacheConfig,
        store: Arc<dyn DistributedStore>,
    ) -> Result<Self, CacheError> {
        Self::build(name.into(), config, Some(store))
    }

    fn build(
        name: String,
        config: CacheConfig,
        store: Option<Arc<dyn DistributedStore>>,
    ) -> Result<Self, CacheError> {
        config.validate()?;

        let shards = (0..config.shard_count)
            .map(|id| Mutex::new(Shard::new(id, config.capacity, config.eviction_percentage)))
            .collect();
        let distributed = store.map(|store| DistributedLayer::new(store, &name));

        debug!(
            "Created cache '{}' with {} shards of {} entries (distributed: {})",
            name,
            config.shard_count,
            config.capacity,
            distributed.is_some()
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                name,
                router: KeyRouter::new(config.shard_count),
                config,
                shards,
                coordinator: Coordinator::new(),
                distributed,
                refresh_buffer: Mutex::new(None),
                buffer_generation: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the value for `key`, calling `fetch` only if neither layer has it.
    ///
    /// A stale value is returned immediately while a background refresh runs.
    /// An expired or missing value blocks until a coalesced fetch completes;
    /// if another caller is already fetching `key`, this call waits for that
    /// result and `fetch` is dropped unused. Origin errors are returned as
    /// [`CacheError::Origin`] and never cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let hit = self.inner.shard(key).lock().get(key, Instant::now());
        match hit {
            Some(Hit {
                value,
                freshness: Freshness::Fresh,
            }) => {
                debug!("Cache hit for key: {}", key);
                return Ok(value);
            }
            Some(Hit {
                value,
                freshness: Freshness::Stale { claimed },
            }) => {
                debug!("Stale cache hit for key: {}", key);
                if claimed {
                    self.inner.spawn_refresh(key.to_owned(), fetch);
                }
                return Ok(value);
            }
            Some(Hit {
                freshness: Freshness::Expired,
                ..
            }) => {
                debug!("Expired cache entry for key: {}", key);
            }
            None => {
                debug!("Cache miss for key: {}", key);
            }
        }

        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_owned();
        self.inner
            .coordinator
            .coalesce(
                key,
                move || async move { inner.load(owned_key, fetch, LoadMode::Foreground).await },
                self.inner.slow_after(),
            )
            .await
    }

    /// Get the values for `keys`, calling `fetch` once with the keys neither layer has.
    ///
    /// Keys the origin does not return are absent from the result. Keys that
    /// another caller is already fetching are awaited rather than refetched.
    /// Stale keys are refreshed in the background, buffered into larger batch
    /// calls when refresh coalescing is configured.
    pub async fn get_or_fetch_batch<F, Fut, E>(
        &self,
        keys: &[String],
        fetch: F,
    ) -> Result<HashMap<String, Arc<V>>, CacheError>
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<String, V>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let fetch: BatchFetch<V> = Arc::new(
            move |keys: Vec<String>| -> BoxFuture<'static, Result<HashMap<String, V>, CacheError>> {
                let fut = fetch(keys);
                Box::pin(async move { fut.await.map_err(CacheError::origin) })
            },
        );

        let now = Instant::now();
        let mut found = HashMap::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());
        let mut stale = Vec::new();
        let mut cold = Vec::new();

        for key in keys {
            if !seen.insert(key.as_str()) {
                continue;
            }
            let hit = self.inner.shard(key).lock().get(key, now);
            match hit {
                Some(Hit {
                    value,
                    freshness: Freshness::Fresh,
                }) => {
                    found.insert(key.clone(), value);
                }
                Some(Hit {
                    value,
                    freshness: Freshness::Stale { claimed },
                }) => {
                    found.insert(key.clone(), value);
                    if claimed {
                        stale.push(key.clone());
                    }
                }
                Some(_) | None => cold.push(key.clone()),
            }
        }
        debug!(
            "Batch lookup: {} local hits, {} stale, {} to load",
            found.len(),
            stale.len(),
            cold.len()
        );

        if !stale.is_empty() {
            self.inner.schedule_batch_refresh(stale, Arc::clone(&fetch));
        }
        if cold.is_empty() {
            return Ok(found);
        }

        let inner = Arc::clone(&self.inner);
        let results = self
            .inner
            .coordinator
            .coalesce_batch(
                cold,
                move |keys| async move { inner.load_batch(keys, fetch, LoadMode::Foreground).await },
                self.inner.slow_after(),
            )
            .await;

        for (key, result) in results {
            match result {
                Ok(value) => {
                    found.insert(key, value);
                }
                Err(CacheError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// The cached value for `key`, if present and not expired. Never fetches.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.inner.shard(key).lock().peek(key, Instant::now())
    }

    /// Store `value` locally and write it through to the distributed store.
    pub async fn set(&self, key: &str, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.inner.store_local(key, Arc::clone(&value));
        if let Some(distributed) = &self.inner.distributed {
            distributed.set(key, value.as_ref()).await;
        }
        value
    }

    /// Remove `key` locally and from the distributed store.
    pub async fn delete(&self, key: &str) {
        self.inner.shard(key).lock().delete(key);
        if let Some(distributed) = &self.inner.distributed {
            distributed.delete(key).await;
        }
    }

    pub async fn delete_batch(&self, keys: &[String]) {
        for key in keys {
            self.inner.shard(key).lock().delete(key);
        }
        if let Some(distributed) = &self.inner.distributed {
            distributed.delete_batch(keys).await;
        }
    }

    /// Drop every local entry. The distributed store is left untouched.
    pub fn clear(&self) {
        for shard in &self.inner.shards {
            shard.lock().clear();
        }
    }

    /// Number of local entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with an origin fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.coordinator.len()
    }

    /// Number of callers waiting on the in-flight fetch for `key`, leader excluded.
    pub fn waiters(&self, key: &str) -> usize {
        self.inner.coordinator.waiters(key)
    }
}

impl<V: Cacheable> CacheInner<V> {
    fn shard(&self, key: &str) -> &Mutex<Shard<V>> {
        let index = self.router.shard_for(key);
        debug_assert!(
            index < self.shards.len(),
            "shard index {index} out of range for {} shards",
            self.shards.len()
        );
        &self.shards[index]
    }

    fn early_refresh(&self) -> Option<&EarlyRefreshConfig> {
        self.config.early_refresh.as_ref()
    }

    fn slow_after(&self) -> Option<Duration> {
        self.early_refresh().map(|e| e.synchronous_refresh_delay)
    }

    fn retry_base_delay(&self) -> Duration {
        self.early_refresh()
            .map_or(EarlyRefreshConfig::default().retry_base_delay, |e| e.retry_base_delay)
    }

    /// TTL plus a freshly drawn refresh delay.
    fn lifetime(&self) -> Lifetime {
        let refresh_delay = self.early_refresh().map(|e| {
            rand::thread_rng().gen_range(e.min_refresh_delay..=e.max_refresh_delay)
        });
        Lifetime {
            ttl: self.config.ttl,
            refresh_delay,
        }
    }

    fn store_local(&self, key: &str, value: Arc<V>) {
        let lifetime = self.lifetime();
        self.shard(key).lock().set(key, value, Instant::now(), lifetime, |k| {
            self.coordinator.is_in_flight(k)
        });
    }

    fn refresh_failed(&self, key: &str) {
        let base = self.retry_base_delay();
        self.shard(key)
            .lock()
            .refresh_failed(key, Instant::now(), base);
    }

    /// Whether a distributed record may be used instead of calling the origin.
    fn accepts<T>(&self, record: &Record<T>, mode: LoadMode) -> bool {
        let interval = self.config.distributed_refresh_interval;
        match mode {
            LoadMode::Foreground => record.is_within(interval),
            // Without an interval a background refresh would only ever re-read
            // the record it is meant to replace.
            LoadMode::Background => interval.is_some() && record.is_within(interval),
        }
    }

    fn consults_distributed(&self, mode: LoadMode) -> Option<&DistributedLayer> {
        match mode {
            LoadMode::Foreground => self.distributed.as_ref(),
            LoadMode::Background => self
                .distributed
                .as_ref()
                .filter(|_| self.config.distributed_refresh_interval.is_some()),
        }
    }

    /// Resolve one key: distributed store first, then the origin.
    ///
    /// Runs inside the coordinator, so at most one load per key is active.
    async fn load<F, Fut, E>(self: Arc<Self>, key: String, fetch: F, mode: LoadMode) -> FetchResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        let mut fallback = None;
        if let Some(distributed) = self.consults_distributed(mode)
            && let Some(record) = distributed.get::<V>(&key).await
        {
            if self.accepts(&record, mode) {
                let value = Arc::new(record.value);
                self.store_local(&key, Arc::clone(&value));
                return Ok(value);
            }
            debug!(
                "Distributed record for key {} is {:?} old; refreshing from origin",
                key, record.age
            );
            if mode == LoadMode::Foreground {
                fallback = Some(record.value);
            }
        }

        match fetch().await {
            Ok(value) => {
                debug!("Fetched key {} from origin", key);
                let value = Arc::new(value);
                self.store_local(&key, Arc::clone(&value));
                if let Some(distributed) = &self.distributed {
                    distributed.set(&key, value.as_ref()).await;
                }
                Ok(value)
            }
            Err(e) => {
                let err = CacheError::origin(e);
                if let Some(value) = fallback {
                    warn!(
                        "Origin fetch failed for key {}: {}. Serving distributed record.",
                        key, err
                    );
                    let value = Arc::new(value);
                    self.store_local(&key, Arc::clone(&value));
                    return Ok(value);
                }
                debug!("Origin fetch failed for key {}: {}", key, err);
                Err(err)
            }
        }
    }

    /// Resolve several keys with one distributed batch read and one origin call.
    async fn load_batch(
        self: Arc<Self>,
        keys: Vec<String>,
        fetch: BatchFetch<V>,
        mode: LoadMode,
    ) -> Result<HashMap<String, Arc<V>>, CacheError> {
        let mut values = HashMap::with_capacity(keys.len());
        let mut fallbacks = HashMap::new();
        let mut remaining = keys;

        if let Some(distributed) = self.consults_distributed(mode) {
            for (key, record) in distributed.get_batch::<V>(&remaining).await {
                if self.accepts(&record, mode) {
                    let value = Arc::new(record.value);
                    self.store_local(&key, Arc::clone(&value));
                    values.insert(key, value);
                } else if mode == LoadMode::Foreground {
                    fallbacks.insert(key, record.value);
                }
            }
            remaining.retain(|key| !values.contains_key(key));
        }
        if remaining.is_empty() {
            return Ok(values);
        }

        let requested: HashSet<String> = remaining.iter().cloned().collect();
        match fetch(remaining).await {
            Ok(fetched) => {
                let fetched: HashMap<String, Arc<V>> = fetched
                    .into_iter()
                    .filter(|(key, _)| requested.contains(key))
                    .map(|(key, value)| (key, Arc::new(value)))
                    .collect();
                debug!(
                    "Fetched {}/{} keys from origin",
                    fetched.len(),
                    requested.len()
                );
                for (key, value) in &fetched {
                    self.store_local(key, Arc::clone(value));
                }
                if let Some(distributed) = &self.distributed {
                    distributed.set_batch(&fetched).await;
                }
                values.extend(fetched);
                Ok(values)
            }
            Err(e) => {
                if fallbacks.is_empty() || !requested.iter().all(|k| fallbacks.contains_key(k)) {
                    debug!("Origin batch fetch failed for {} keys: {}", requested.len(), e);
                    return Err(e);
                }
                warn!(
                    "Origin batch fetch failed for {} keys: {}. Serving distributed records.",
                    requested.len(),
                    e
                );
                for (key, value) in fallbacks {
                    let value = Arc::new(value);
                    self.store_local(&key, Arc::clone(&value));
                    values.insert(key, value);
                }
                Ok(values)
            }
        }
    }

    /// Refresh `key` on a detached task. Failures only back off the next attempt.
    fn spawn_refresh<F, Fut, E>(self: &Arc<Self>, key: String, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let work_inner = Arc::clone(&inner);
            let work_key = key.clone();
            let result = inner
                .coordinator
                .coalesce(
                    &key,
                    move || async move {
                        work_inner
                            .load(work_key, fetch, LoadMode::Background)
                            .await
                    },
                    None,
                )
                .await;

            match result {
                Ok(_) => debug!("Background refresh completed for key: {}", key),
                Err(e) => {
                    warn!("Background refresh failed for key {}: {}", key, e);
                    inner.refresh_failed(&key);
                }
            }
        });
    }

    /// Queue stale keys for a background batch refresh.
    fn schedule_batch_refresh(self: &Arc<Self>, keys: Vec<String>, fetch: BatchFetch<V>) {
        let Some(coalescing) = self.config.refresh_coalescing else {
            self.spawn_batch_refresh(keys, fetch);
            return;
        };

        let mut ready = Vec::new();
        {
            let mut pending = self.refresh_buffer.lock();
            for key in keys {
                let batch = pending.get_or_insert_with(|| {
                    let generation = self.buffer_generation.fetch_add(1, Ordering::Relaxed);
                    self.arm_buffer_timer(generation, coalescing.buffer_timeout);
                    PendingRefresh {
                        generation,
                        keys: Vec::new(),
                        fetch: Arc::clone(&fetch),
                    }
                });
                if !batch.keys.contains(&key) {
                    batch.keys.push(key);
                }
                if batch.keys.len() >= coalescing.buffer_size
                    && let Some(full) = pending.take()
                {
                    ready.push(full);
                }
            }
        }

        for batch in ready {
            debug!("Refresh buffer full; flushing {} keys", batch.keys.len());
            self.spawn_batch_refresh(batch.keys, batch.fetch);
        }
    }

    /// Flush the buffer cycle `generation` once `timeout` has passed, unless it was already flushed.
    fn arm_buffer_timer(self: &Arc<Self>, generation: u64, timeout: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let batch = {
                let mut pending = inner.refresh_buffer.lock();
                match pending.as_ref() {
                    Some(batch) if batch.generation == generation => pending.take(),
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                debug!("Refresh buffer timed out; flushing {} keys", batch.keys.len());
                inner.run_batch_refresh(batch.keys, batch.fetch).await;
            }
        });
    }

    fn spawn_batch_refresh(self: &Arc<Self>, keys: Vec<String>, fetch: BatchFetch<V>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_batch_refresh(keys, fetch).await });
    }

    async fn run_batch_refresh(self: Arc<Self>, keys: Vec<String>, fetch: BatchFetch<V>) {
        let total = keys.len();
        let work_inner = Arc::clone(&self);
        let results = self
            .coordinator
            .coalesce_batch(
                keys,
                move |keys| async move {
                    work_inner
                        .load_batch(keys, fetch, LoadMode::Background)
                        .await
                },
                None,
            )
            .await;

        let mut failed = 0usize;
        for (key, result) in results {
            if let Err(e) = result {
                failed += 1;
                debug!("Background refresh failed for key {}: {}", key, e);
                self.refresh_failed(&key);
            }
        }
        if failed > 0 {
            warn!("Background batch refresh: {} of {} keys failed", failed, total);
        } else {
            debug!("Background batch refresh completed for {} keys", total);
        }
    }
}
