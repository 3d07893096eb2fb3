use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::entry::{Entry, EntryState, Hit, Lifetime};
use crate::eviction;

/// A fixed-size bucket of entries.
///
/// The shard is not thread-safe on its own; the cache wraps it in a Mutex.
/// Nothing here performs I/O, so critical sections stay short.
pub(crate) struct Shard<V> {
    id: usize,
    entries: HashMap<String, Entry<V>>,
    capacity: usize,
    eviction_percentage: u8,
    /// Next insertion sequence number
    next_insertion: u64,
}

impl<V> Shard<V> {
    pub fn new(id: usize, capacity: usize, eviction_percentage: u8) -> Self {
        Self {
            id,
            entries: HashMap::new(),
            capacity,
            eviction_percentage,
            next_insertion: 0,
        }
    }

    /// Look up `key`, recording the access.
    pub fn get(&mut self, key: &str, now: Instant) -> Option<Hit<V>> {
        let entry = self.entries.get_mut(key)?;
        let freshness = entry.touch(now);
        Some(Hit {
            value: Arc::clone(&entry.value),
            freshness,
        })
    }

    /// Value of `key` without touching access statistics.
    pub fn peek(&self, key: &str, now: Instant) -> Option<Arc<V>> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| Arc::clone(&entry.value))
    }

    /// Store `value` under `key`, evicting first if a new key would overflow the shard.
    ///
    /// Replacing an existing key keeps its access statistics and insertion
    /// position but resets its timestamps, state and refresh backoff.
    pub fn set<P>(
        &mut self,
        key: &str,
        value: Arc<V>,
        now: Instant,
        lifetime: Lifetime,
        protected: P,
    ) where
        P: Fn(&str) -> bool,
    {
        if let Some(existing) = self.entries.get_mut(key) {
            let mut entry = Entry::new(value, now, lifetime, existing.insertion);
            entry.last_access = existing.last_access;
            entry.access_count = existing.access_count;
            *existing = entry;
            return;
        }

        self.evict_if_needed(now, protected);

        let insertion = self.next_insertion;
        self.next_insertion += 1;
        self.entries
            .insert(key.to_owned(), Entry::new(value, now, lifetime, insertion));
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Evict a share of the entries once the shard is at capacity.
    ///
    /// Returns the number of evicted entries.
    pub fn evict_if_needed<P>(&mut self, now: Instant, protected: P) -> usize
    where
        P: Fn(&str) -> bool,
    {
        if self.entries.len() < self.capacity {
            return 0;
        }

        let count = eviction::eviction_count(self.entries.len(), self.eviction_percentage);
        let victims = eviction::select_victims(&self.entries, count, now, protected);
        if victims.is_empty() {
            warn!(
                "Shard {}: at capacity ({} entries) but every entry is protected; skipping eviction",
                self.id,
                self.entries.len()
            );
            return 0;
        }

        for key in &victims {
            self.entries.remove(key);
        }
        debug!("Shard {}: evicted {} entries", self.id, victims.len());
        victims.len()
    }

    /// Mark `key` as being refreshed so eviction leaves it alone.
    ///
    /// Returns false if the key is absent or already being refreshed.
    #[cfg(test)]
    pub fn begin_refresh(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.state != EntryState::RefreshInProgress => {
                entry.state = EntryState::RefreshInProgress;
                true
            }
            _ => false,
        }
    }

    /// Record a failed background refresh and schedule the next attempt.
    pub fn refresh_failed(&mut self, key: &str, now: Instant, retry_base_delay: Duration) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.back_off(now, retry_base_delay);
            debug!(
                "Shard {}: refresh of key {} failed {} time(s); value stored {:?} ago, next attempt in {:?}",
                self.id,
                key,
                entry.refresh_failures,
                now.saturating_duration_since(entry.stored_at),
                entry.refresh_after.saturating_duration_since(now)
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn state(&self, key: &str) -> Option<EntryState> {
        self.entries.get(key).map(|entry| entry.state)
    }
}
