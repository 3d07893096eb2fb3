//! Key to shard routing

use ahash::RandomState;

// Fixed seeds keep the key to shard mapping stable for the lifetime of a cache.
const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

/// Maps a key to one of a fixed number of shards.
#[derive(Clone)]
pub struct KeyRouter {
    hasher: RandomState,
    shard_count: usize,
}

impl KeyRouter {
    pub fn new(shard_count: usize) -> Self {
        assert!(shard_count > 0, "shard_count must be at least 1");
        Self {
            hasher: RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]),
            shard_count,
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// Index of the shard owning `key`.
    pub fn shard_for(&self, key: &str) -> usize {
        let hash = self.hasher.hash_one(key);
        (hash % self.shard_count as u64) as usize
    }
}

impl std::fmt::Debug for KeyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRouter")
            .field("shard_count", &self.shard_count)
            .finish()
    }
}
