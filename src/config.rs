//! Cache configuration

use std::time::Duration;

use crate::CacheError;

/// Configuration for a [`Cache`](crate::Cache)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries held by each shard
    pub capacity: usize,
    /// Number of shards the key space is split across
    pub shard_count: usize,
    /// Time-to-live for in-process entries
    pub ttl: Duration,
    /// Share of a full shard's entries removed per eviction cycle (0-100)
    pub eviction_percentage: u8,
    /// Proactive refreshes ahead of expiry. `None` refreshes only once an entry has expired.
    pub early_refresh: Option<EarlyRefreshConfig>,
    /// Buffering of background refreshes issued by batch reads
    pub refresh_coalescing: Option<RefreshCoalescing>,
    /// Maximum age of a distributed record before it is refreshed from the origin.
    /// `None` trusts distributed records for as long as the store keeps them.
    pub distributed_refresh_interval: Option<Duration>,
}

/// Timing of early (pre-expiry) refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyRefreshConfig {
    /// Lower bound of the random delay between a store and its refresh
    pub min_refresh_delay: Duration,
    /// Upper bound of the random delay between a store and its refresh
    pub max_refresh_delay: Duration,
    /// How long a read of an expired entry waits before logging a slow refresh
    pub synchronous_refresh_delay: Duration,
    /// First backoff step after a failed background refresh
    pub retry_base_delay: Duration,
}

impl Default for EarlyRefreshConfig {
    fn default() -> Self {
        Self {
            min_refresh_delay: Duration::from_millis(10),
            max_refresh_delay: Duration::from_millis(30),
            synchronous_refresh_delay: Duration::from_secs(10),
            retry_base_delay: Duration::from_millis(10),
        }
    }
}

/// Buffering of background batch refreshes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshCoalescing {
    /// Flush once this many keys are waiting
    pub buffer_size: usize,
    /// Flush at the latest this long after the first key was buffered
    pub buffer_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttl = Duration::from_secs(10);
        Self {
            capacity: 10_000,
            shard_count: 10,
            ttl,
            eviction_percentage: 10,
            early_refresh: Some(EarlyRefreshConfig::default()),
            refresh_coalescing: Some(RefreshCoalescing {
                buffer_size: 3,
                buffer_timeout: ttl,
            }),
            distributed_refresh_interval: Some(Duration::from_secs(10)),
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Set the TTL for the cache.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_eviction_percentage(mut self, percentage: u8) -> Self {
        self.eviction_percentage = percentage;
        self
    }

    /// Enable early refreshes with the given timings.
    pub fn with_early_refreshes(
        mut self,
        min_refresh_delay: Duration,
        max_refresh_delay: Duration,
        synchronous_refresh_delay: Duration,
        retry_base_delay: Duration,
    ) -> Self {
        self.early_refresh = Some(EarlyRefreshConfig {
            min_refresh_delay,
            max_refresh_delay,
            synchronous_refresh_delay,
            retry_base_delay,
        });
        self
    }

    pub fn without_early_refreshes(mut self) -> Self {
        self.early_refresh = None;
        self
    }

    pub fn with_refresh_coalescing(mut self, buffer_size: usize, buffer_timeout: Duration) -> Self {
        self.refresh_coalescing = Some(RefreshCoalescing {
            buffer_size,
            buffer_timeout,
        });
        self
    }

    pub fn without_refresh_coalescing(mut self) -> Self {
        self.refresh_coalescing = None;
        self
    }

    pub fn with_distributed_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.distributed_refresh_interval = interval;
        self
    }

    /// Check the configuration for values the cache cannot run with.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.capacity == 0 {
            return Err(CacheError::InvalidConfig("capacity must be at least 1".to_owned()));
        }
        if self.shard_count == 0 {
            return Err(CacheError::InvalidConfig("shard_count must be at least 1".to_owned()));
        }
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be non-zero".to_owned()));
        }
        if self.eviction_percentage > 100 {
            return Err(CacheError::InvalidConfig(format!(
                "eviction_percentage must be between 0 and 100, got {}",
                self.eviction_percentage
            )));
        }
        if let Some(early) = &self.early_refresh
            && early.min_refresh_delay > early.max_refresh_delay
        {
            return Err(CacheError::InvalidConfig(format!(
                "min_refresh_delay ({:?}) exceeds max_refresh_delay ({:?})",
                early.min_refresh_delay, early.max_refresh_delay
            )));
        }
        if let Some(coalescing) = &self.refresh_coalescing
            && coalescing.buffer_size == 0
        {
            return Err(CacheError::InvalidConfig(
                "refresh coalescing buffer_size must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
