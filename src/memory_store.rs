//! In-process distributed store
//!
//! Shares records between cache instances living in the same process. Handy
//! for tests and for running without Redis.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::entry::deadline;
use crate::{CacheError, DistributedStore};

/// Default record lifetime when none is given.
pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(300);

struct StoredBytes {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// A [`DistributedStore`] backed by a mutex-guarded map.
pub struct MemoryStore {
    records: Mutex<HashMap<String, StoredBytes>>,
    ttl: Duration,
}

impl MemoryStore {
    /// Create a store whose records live for `ttl` (5 minutes if `None` or zero).
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ttl: ttl.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_STORE_TTL),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records
            .lock()
            .values()
            .filter(|r| r.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Drop records whose TTL has passed, including keys that are never read again.
fn prune_expired(records: &mut HashMap<String, StoredBytes>, now: Instant) {
    records.retain(|_, record| record.expires_at > now);
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        let expired = match records.get(key) {
            Some(record) if record.expires_at > now => return Ok(Some(record.bytes.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            records.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = deadline(now, self.ttl);
        let mut records = self.records.lock();
        prune_expired(&mut records, now);
        records.insert(
            key.to_owned(),
            StoredBytes {
                bytes: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.records.lock().remove(key);
        Ok(())
    }

    async fn set_batch(&self, records: HashMap<String, Vec<u8>>) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = deadline(now, self.ttl);
        let mut stored = self.records.lock();
        prune_expired(&mut stored, now);
        for (key, bytes) in records {
            stored.insert(key, StoredBytes { bytes, expires_at });
        }
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut stored = self.records.lock();
        for key in keys {
            stored.remove(key);
        }
        Ok(())
    }
}
