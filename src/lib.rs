//! refresh-cache - Self-refreshing read-through cache
//!
//! This library caches values fetched from a slow or unreliable origin:
//! - Sharded in-process storage with capacity-based eviction
//! - Coalescing of concurrent fetches for the same key into one origin call
//! - Early background refreshes at a randomized point before expiry
//! - Optional distributed store (Redis or in-process) shared across instances
//!
//! The cache supports:
//! - Single-key and batch reads (`get_or_fetch`, `get_or_fetch_batch`)
//! - Buffering of background batch refreshes into larger origin calls
//! - Exponential backoff of background refreshes against a failing origin
//! - Best-effort distributed writes: store failures never reach the caller
//!
//! ```rust,ignore
//! use refresh_cache::{Cache, CacheConfig};
//!
//! let cache: Cache<Leaderboard> = Cache::new("lb", CacheConfig::default())?;
//! let board = cache
//!     .get_or_fetch("lb:42", || async { load_leaderboard(42).await })
//!     .await?;
//! ```

mod cache;
mod config;
mod coordinator;
mod distributed;
mod entry;
mod error;
mod eviction;
mod memory_store;
mod redis_store;
mod router;
mod shard;

pub use cache::{Cache, Cacheable};
pub use config::{CacheConfig, EarlyRefreshConfig, RefreshCoalescing};
pub use distributed::DistributedStore;
pub use error::{BoxError, CacheError, SharedError};
pub use memory_store::{DEFAULT_STORE_TTL, MemoryStore};
pub use redis_store::RedisStore;
pub use router::KeyRouter;

// Re-export async_trait for store implementations
pub use async_trait::async_trait;
