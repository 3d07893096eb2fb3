//! Distributed store boundary
//!
//! The cache consults a shared key/value store before calling the origin and
//! writes fetched values through to it. The store is an optimization only:
//! every failure is logged and treated as a miss or a skipped write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CacheError, Cacheable};

/// A networked key/value store shared between cache instances.
///
/// Values are opaque bytes. Implementations apply their own TTL. Only the
/// single-key operations are required; the batch operations default to
/// looping over them.
#[async_trait]
pub trait DistributedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Fetch several keys. Missing keys are simply absent from the result.
    async fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        let mut records = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                records.insert(key.clone(), value);
            }
        }
        Ok(records)
    }

    async fn set_batch(&self, records: HashMap<String, Vec<u8>>) -> Result<(), CacheError> {
        for (key, value) in records {
            self.set(&key, value).await?;
        }
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

/// Envelope stored in the distributed layer.
#[derive(Serialize, Deserialize)]
struct StoredRecord<V> {
    /// Milliseconds since the Unix epoch at write time
    created_at_ms: u64,
    value: V,
}

/// A value read back from the distributed layer.
#[derive(Debug)]
pub(crate) struct Record<V> {
    pub value: V,
    pub age: Duration,
}

impl<V> Record<V> {
    /// Whether the record is recent enough to skip an origin refresh.
    pub fn is_within(&self, interval: Option<Duration>) -> bool {
        interval.is_none_or(|interval| self.age <= interval)
    }
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn encode<V: Cacheable>(value: &V, created_at: SystemTime) -> Result<Vec<u8>, CacheError> {
    let record = StoredRecord {
        created_at_ms: unix_millis(created_at),
        value,
    };
    Ok(serde_json::to_vec(&record)?)
}

pub(crate) fn decode<V: Cacheable>(bytes: &[u8], now: SystemTime) -> Result<Record<V>, CacheError> {
    let record: StoredRecord<V> = serde_json::from_slice(bytes)?;
    let age = unix_millis(now).saturating_sub(record.created_at_ms);
    Ok(Record {
        value: record.value,
        age: Duration::from_millis(age),
    })
}

/// Best-effort access to the distributed store for one cache.
///
/// Keys are namespaced with the cache name so several caches can share a store.
pub(crate) struct DistributedLayer {
    store: Arc<dyn DistributedStore>,
    namespace: String,
}

impl DistributedLayer {
    pub fn new(store: Arc<dyn DistributedStore>, cache_name: &str) -> Self {
        Self {
            store,
            namespace: format!("{cache_name}:"),
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub async fn get<V: Cacheable>(&self, key: &str) -> Option<Record<V>> {
        let store_key = self.store_key(key);
        let bytes = match self.store.get(&store_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("Distributed miss for key: {}", key);
                return None;
            }
            Err(e) => {
                debug!("Distributed GET failed for key {}: {}. Treating as miss.", key, e);
                return None;
            }
        };

        match decode(&bytes, SystemTime::now()) {
            Ok(record) => {
                debug!("Distributed hit for key: {} (age {:?})", key, record.age);
                Some(record)
            }
            Err(e) => {
                warn!(
                    "Failed to decode distributed record for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.store.delete(&store_key).await {
                    warn!(
                        "Failed to delete corrupt distributed record for key {} (store key: {}): {}",
                        key, store_key, del_err
                    );
                }
                None
            }
        }
    }

    pub async fn get_batch<V: Cacheable>(&self, keys: &[String]) -> HashMap<String, Record<V>> {
        if keys.is_empty() {
            return HashMap::new();
        }
        let store_keys: Vec<String> = keys.iter().map(|k| self.store_key(k)).collect();
        let mut found = match self.store.get_batch(&store_keys).await {
            Ok(found) => found,
            Err(e) => {
                debug!(
                    "Distributed batch GET failed for {} keys: {}. Treating as miss.",
                    keys.len(),
                    e
                );
                return HashMap::new();
            }
        };

        let now = SystemTime::now();
        let mut records = HashMap::with_capacity(found.len());
        let mut corrupt = Vec::new();
        for (key, store_key) in keys.iter().zip(store_keys) {
            let Some(bytes) = found.remove(&store_key) else {
                continue;
            };
            match decode(&bytes, now) {
                Ok(record) => {
                    records.insert(key.clone(), record);
                }
                Err(e) => {
                    warn!(
                        "Failed to decode distributed record for key {}: {}. Deleting corrupt entry.",
                        key, e
                    );
                    corrupt.push(store_key);
                }
            }
        }
        if !corrupt.is_empty()
            && let Err(e) = self.store.delete_batch(&corrupt).await
        {
            warn!("Failed to delete {} corrupt distributed records: {}", corrupt.len(), e);
        }

        debug!("Distributed batch lookup: {}/{} hits", records.len(), keys.len());
        records
    }

    pub async fn set<V: Cacheable>(&self, key: &str, value: &V) {
        let bytes = match encode(value, SystemTime::now()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode value for key {}: {}. Skipping write.", key, e);
                return;
            }
        };
        if let Err(e) = self.store.set(&self.store_key(key), bytes).await {
            warn!("Distributed SET failed for key {}: {}. Continuing.", key, e);
        }
    }

    pub async fn set_batch<V: Cacheable>(&self, values: &HashMap<String, Arc<V>>) {
        if values.is_empty() {
            return;
        }
        let now = SystemTime::now();
        let mut records = HashMap::with_capacity(values.len());
        for (key, value) in values {
            match encode(value.as_ref(), now) {
                Ok(bytes) => {
                    records.insert(self.store_key(key), bytes);
                }
                Err(e) => warn!("Failed to encode value for key {}: {}. Skipping write.", key, e),
            }
        }
        if let Err(e) = self.store.set_batch(records).await {
            warn!("Distributed batch SET failed for {} keys: {}. Continuing.", values.len(), e);
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(&self.store_key(key)).await {
            warn!("Distributed DEL failed for key {}: {}. Continuing.", key, e);
        }
    }

    pub async fn delete_batch(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let store_keys: Vec<String> = keys.iter().map(|k| self.store_key(k)).collect();
        if let Err(e) = self.store.delete_batch(&store_keys).await {
            warn!("Distributed batch DEL failed for {} keys: {}. Continuing.", keys.len(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn envelope_records_age() {
        let written = UNIX_EPOCH + Duration::from_secs(1_000);
        let bytes = encode(&"v".to_owned(), written).unwrap();
        let record: Record<String> = decode(&bytes, written + Duration::from_secs(3)).unwrap();
        assert_eq!(record.value, "v");
        assert_eq!(record.age, Duration::from_secs(3));
        assert!(record.is_within(Some(Duration::from_secs(5))));
        assert!(!record.is_within(Some(Duration::from_secs(2))));
        assert!(record.is_within(None));
    }

    #[tokio::test]
    async fn keys_are_namespaced_by_cache_name() {
        let store = Arc::new(MemoryStore::new(None));
        let layer = DistributedLayer::new(store.clone(), "lb");

        layer.set("k1", &42u32).await;
        assert!(store.get("lb:k1").await.unwrap().is_some());
        assert!(store.get("k1").await.unwrap().is_none());

        let record: Record<u32> = layer.get("k1").await.unwrap();
        assert_eq!(record.value, 42);
    }

    #[tokio::test]
    async fn corrupt_records_are_deleted() {
        let store = Arc::new(MemoryStore::new(None));
        store.set("lb:k1", b"not json".to_vec()).await.unwrap();
        let layer = DistributedLayer::new(store.clone(), "lb");

        assert!(layer.get::<u32>("k1").await.is_none());
        assert!(store.get("lb:k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_round_trip_skips_missing_keys() {
        let store = Arc::new(MemoryStore::new(None));
        let layer = DistributedLayer::new(store, "lb");

        let values = HashMap::from([
            ("a".to_owned(), Arc::new(1u32)),
            ("b".to_owned(), Arc::new(2u32)),
        ]);
        layer.set_batch(&values).await;

        let keys = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let records: HashMap<String, Record<u32>> = layer.get_batch(&keys).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records["b"].value, 2);

        layer.delete_batch(&keys).await;
        assert!(layer.get_batch::<u32>(&keys).await.is_empty());
    }
}
