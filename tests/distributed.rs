use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use refresh_cache::{Cache, CacheConfig, CacheError, DistributedStore, MemoryStore, async_trait};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Score {
    player: String,
    points: u32,
}

fn score(points: u32) -> Score {
    Score {
        player: "ada".to_owned(),
        points,
    }
}

/// Store whose every operation fails, as if the network were down.
struct UnreachableStore;

fn unreachable() -> CacheError {
    CacheError::Store(Arc::new(std::io::Error::other("connection refused")))
}

#[async_trait]
impl DistributedStore for UnreachableStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(unreachable())
    }

    async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), CacheError> {
        Err(unreachable())
    }

    async fn delete(&self, _key: &str) -> Result<(), CacheError> {
        Err(unreachable())
    }

    async fn get_batch(&self, _keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        Err(unreachable())
    }
}

fn config() -> CacheConfig {
    CacheConfig::default()
        .with_ttl(Duration::from_secs(10))
        .with_early_refreshes(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_millis(10),
        )
        .with_distributed_refresh_interval(Some(Duration::from_secs(60)))
}

/// Counts origin calls and returns `points` each time.
fn counted(
    calls: &Arc<AtomicU32>,
    points: u32,
) -> impl FnOnce() -> BoxFuture<'static, Result<Score, CacheError>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || -> BoxFuture<'static, Result<Score, CacheError>> {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(score(points))
        })
    }
}

fn failing(
    calls: &Arc<AtomicU32>,
) -> impl FnOnce() -> BoxFuture<'static, Result<Score, &'static str>> + Send + 'static {
    let calls = Arc::clone(calls);
    move || -> BoxFuture<'static, Result<Score, &'static str>> {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("origin unavailable")
        })
    }
}

#[tokio::test]
async fn second_instance_reads_through_the_shared_store() {
    let store = Arc::new(MemoryStore::default());
    let first: Cache<Score> =
        Cache::with_distributed_store("lb", config(), store.clone()).unwrap();
    let second: Cache<Score> =
        Cache::with_distributed_store("lb", config(), store.clone()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let fetched = first.get_or_fetch("k1", counted(&calls, 10)).await.unwrap();
    assert_eq!(fetched.points, 10);
    assert_eq!(store.len(), 1);

    let shared = second.get_or_fetch("k1", counted(&calls, 99)).await.unwrap();
    assert_eq!(shared.points, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Adopted records land in the local shard too.
    assert_eq!(second.get("k1").unwrap().points, 10);
}

#[tokio::test]
async fn cache_names_namespace_the_store() {
    let store = Arc::new(MemoryStore::default());
    let weekly: Cache<Score> =
        Cache::with_distributed_store("weekly", config(), store.clone()).unwrap();
    let daily: Cache<Score> =
        Cache::with_distributed_store("daily", config(), store.clone()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    weekly.get_or_fetch("k1", counted(&calls, 1)).await.unwrap();
    let other = daily.get_or_fetch("k1", counted(&calls, 2)).await.unwrap();

    assert_eq!(other.points, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(store.get("weekly:k1").await.unwrap().is_some());
    assert!(store.get("daily:k1").await.unwrap().is_some());
}

#[tokio::test]
async fn unreachable_store_degrades_to_origin() {
    let cache: Cache<Score> =
        Cache::with_distributed_store("lb", config(), Arc::new(UnreachableStore)).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let value = cache.get_or_fetch("k1", counted(&calls, 7)).await.unwrap();
    assert_eq!(value.points, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Writes and deletes swallow store errors too.
    cache.set("k2", score(3)).await;
    assert_eq!(cache.get("k2").unwrap().points, 3);
    cache.delete("k2").await;
    assert!(cache.get("k2").is_none());

    let keys = vec!["k3".to_owned(), "k4".to_owned()];
    let values = cache
        .get_or_fetch_batch(&keys, |keys: Vec<String>| async move {
            Ok::<_, CacheError>(keys.into_iter().map(|k| (k, score(5))).collect())
        })
        .await
        .unwrap();
    assert_eq!(values.len(), 2);
}

#[tokio::test]
async fn old_record_is_refreshed_from_origin() {
    let store = Arc::new(MemoryStore::default());
    let stored = serde_json::json!({ "created_at_ms": 0, "value": score(1) });
    store
        .set("lb:k1", serde_json::to_vec(&stored).unwrap())
        .await
        .unwrap();

    let cache: Cache<Score> = Cache::with_distributed_store("lb", config(), store.clone()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let value = cache.get_or_fetch("k1", counted(&calls, 2)).await.unwrap();
    assert_eq!(value.points, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The fresh value was written back over the old record.
    let other: Cache<Score> = Cache::with_distributed_store("lb", config(), store).unwrap();
    let shared = other.get_or_fetch("k1", counted(&calls, 3)).await.unwrap();
    assert_eq!(shared.points, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn old_record_is_served_when_origin_fails() {
    let store = Arc::new(MemoryStore::default());
    let stored = serde_json::json!({ "created_at_ms": 0, "value": score(1) });
    store
        .set("lb:k1", serde_json::to_vec(&stored).unwrap())
        .await
        .unwrap();

    let cache: Cache<Score> = Cache::with_distributed_store("lb", config(), store).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let value = cache.get_or_fetch("k1", failing(&calls)).await.unwrap();
    assert_eq!(value.points, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn any_record_is_accepted_without_refresh_interval() {
    let store = Arc::new(MemoryStore::default());
    let stored = serde_json::json!({ "created_at_ms": 0, "value": score(1) });
    store
        .set("lb:k1", serde_json::to_vec(&stored).unwrap())
        .await
        .unwrap();

    let cache: Cache<Score> = Cache::with_distributed_store(
        "lb",
        config().with_distributed_refresh_interval(None),
        store,
    )
    .unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let value = cache.get_or_fetch("k1", counted(&calls, 2)).await.unwrap();
    assert_eq!(value.points, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn corrupt_record_is_dropped() {
    let store = Arc::new(MemoryStore::default());
    store.set("lb:k1", b"not json".to_vec()).await.unwrap();

    let cache: Cache<Score> = Cache::with_distributed_store("lb", config(), store.clone()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let value = cache.get_or_fetch("k1", counted(&calls, 4)).await.unwrap();
    assert_eq!(value.points, 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let bytes = store.get("lb:k1").await.unwrap().unwrap();
    let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record["value"]["points"], 4);
}

#[tokio::test(start_paused = true)]
async fn background_refresh_adopts_a_newer_shared_record() {
    let store = Arc::new(MemoryStore::default());
    let writer: Cache<Score> = Cache::with_distributed_store("lb", config(), store.clone()).unwrap();
    let reader: Cache<Score> = Cache::with_distributed_store("lb", config(), store.clone()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    reader.set("k1", score(1)).await;
    writer.set("k1", score(2)).await;

    tokio::time::advance(Duration::from_secs(3)).await;
    let stale = reader.get_or_fetch("k1", counted(&calls, 3)).await.unwrap();
    assert_eq!(stale.points, 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(reader.get("k1").unwrap().points, 2);
}

#[tokio::test(start_paused = true)]
async fn background_refresh_without_interval_goes_to_origin() {
    let store = Arc::new(MemoryStore::default());
    let config = config().with_distributed_refresh_interval(None);
    let cache: Cache<Score> = Cache::with_distributed_store("lb", config, store.clone()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    cache.set("k1", score(1)).await;
    tokio::time::advance(Duration::from_secs(3)).await;
    cache.get_or_fetch("k1", counted(&calls, 2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get("k1").unwrap().points, 2);

    let bytes = store.get("lb:k1").await.unwrap().unwrap();
    let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(record["value"]["points"], 2);
}

#[tokio::test]
async fn delete_removes_the_shared_record() {
    let store = Arc::new(MemoryStore::default());
    let cache: Cache<Score> = Cache::with_distributed_store("lb", config(), store.clone()).unwrap();

    cache.set("k1", score(1)).await;
    cache.set("k2", score(2)).await;
    cache.set("k3", score(3)).await;
    assert_eq!(store.len(), 3);

    cache.delete("k1").await;
    assert!(store.get("lb:k1").await.unwrap().is_none());

    cache
        .delete_batch(&["k2".to_owned(), "k3".to_owned()])
        .await;
    assert!(store.is_empty());
    assert!(cache.is_empty());
}
