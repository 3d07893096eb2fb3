//! Capacity-triggered eviction policy
//!
//! Entries are ranked by a recency/frequency score: frequently read entries
//! survive longer, and an entry's value decays with the time since its last
//! read. Expired entries always rank lowest. Equal scores fall back to
//! insertion order, oldest first.

use std::cmp::Ordering;

use tokio::time::Instant;

use crate::entry::{Entry, EntryState};

/// Number of entries to remove from a full shard.
///
/// Always at least one so that a full shard can admit a new key.
pub(crate) fn eviction_count(len: usize, percentage: u8) -> usize {
    let count = (len * percentage as usize).div_ceil(100);
    count.clamp(1, len.max(1))
}

/// Retention score: higher means more worth keeping.
pub(crate) fn retention_score<V>(entry: &Entry<V>, now: Instant) -> f64 {
    if entry.is_expired(now) {
        return f64::NEG_INFINITY;
    }
    let idle = now.saturating_duration_since(entry.last_access).as_secs_f64();
    (entry.access_count as f64 + 1.0) / (idle + 1.0)
}

/// Pick up to `count` keys to evict.
///
/// Entries with a refresh in flight, or for which `protected` returns true,
/// are never chosen.
pub(crate) fn select_victims<'a, V, I, P>(
    entries: I,
    count: usize,
    now: Instant,
    protected: P,
) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a Entry<V>)>,
    V: 'a,
    P: Fn(&str) -> bool,
{
    let mut candidates: Vec<(f64, u64, &String)> = entries
        .into_iter()
        .filter(|(key, entry)| {
            entry.state != EntryState::RefreshInProgress && !protected(key.as_str())
        })
        .map(|(key, entry)| (retention_score(entry, now), entry.insertion, key))
        .collect();

    candidates.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });

    candidates
        .into_iter()
        .take(count)
        .map(|(_, _, key)| key.clone())
        .collect()
}
