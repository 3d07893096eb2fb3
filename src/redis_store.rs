//! Redis-backed distributed store

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::debug;

use crate::memory_store::DEFAULT_STORE_TTL;
use crate::{CacheError, DistributedStore};

/// A [`DistributedStore`] on top of a Redis connection manager.
///
/// Every write sets an expiry; the Redis TTL is independent of the
/// in-process TTL of the caches sharing the store.
#[derive(Clone)]
pub struct RedisStore {
    redis: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl RedisStore {
    /// Connect to Redis. Records live for `ttl`, or 5 minutes if `None` or zero.
    pub async fn new(client: redis::Client, ttl: Option<Duration>) -> Result<Self, CacheError> {
        let redis = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::with_connection(redis, ttl))
    }

    pub fn with_connection(redis: redis::aio::ConnectionManager, ttl: Option<Duration>) -> Self {
        Self {
            redis,
            ttl: ttl.filter(|t| !t.is_zero()).unwrap_or(DEFAULT_STORE_TTL),
        }
    }

    fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(key, value, self.ttl_seconds())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn get_batch(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.redis.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;

        let records: HashMap<String, Vec<u8>> = keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect();
        debug!("Redis MGET: {}/{} keys found", records.len(), keys.len());
        Ok(records)
    }

    async fn set_batch(&self, records: HashMap<String, Vec<u8>>) -> Result<(), CacheError> {
        if records.is_empty() {
            return Ok(());
        }
        let ttl = self.ttl_seconds();
        let mut pipe = redis::pipe();
        for (key, value) in records {
            pipe.set_ex(key, value, ttl).ignore();
        }
        let mut conn = self.redis.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }
}
