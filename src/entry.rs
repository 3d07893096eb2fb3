//! Cache entries and their lifecycle timestamps

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Fresh,
    /// A refresh is running; the current value keeps being served.
    RefreshInProgress,
    Expired,
}

/// How a read found an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `refresh_after`.
    Fresh,
    /// Between `refresh_after` and `expires_at`. `claimed` is true for the one
    /// reader that moved the entry into `RefreshInProgress` and must refresh it.
    Stale { claimed: bool },
    /// At or past `expires_at`.
    Expired,
}

/// A value found by a local lookup.
#[derive(Debug)]
pub struct Hit<V> {
    pub value: Arc<V>,
    pub freshness: Freshness,
}

/// Entry owned by a shard.
#[derive(Debug)]
pub(crate) struct Entry<V> {
    pub value: Arc<V>,
    pub stored_at: Instant,
    pub expires_at: Instant,
    pub refresh_after: Instant,
    pub state: EntryState,
    pub last_access: Instant,
    pub access_count: u64,
    /// Position in the shard's insertion order
    pub insertion: u64,
    /// Consecutive failed background refreshes
    pub refresh_failures: u32,
}

/// Timing applied to an entry when it is stored.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lifetime {
    pub ttl: Duration,
    pub refresh_delay: Option<Duration>,
}

/// Roughly 30 years; stands in for deadlines too far out to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, saturating to a far-future instant instead of overflowing.
pub(crate) fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl<V> Entry<V> {
    pub fn new(value: Arc<V>, now: Instant, lifetime: Lifetime, insertion: u64) -> Self {
        let expires_at = deadline(now, lifetime.ttl);
        let refresh_after = match lifetime.refresh_delay {
            Some(delay) => deadline(now, delay).min(expires_at),
            None => expires_at,
        };
        Self {
            value,
            stored_at: now,
            expires_at,
            refresh_after,
            state: EntryState::Fresh,
            last_access: now,
            access_count: 0,
            insertion,
            refresh_failures: 0,
        }
    }

    /// Record a read and classify the entry, claiming the refresh if it is stale.
    pub fn touch(&mut self, now: Instant) -> Freshness {
        self.last_access = now;
        self.access_count = self.access_count.saturating_add(1);

        if now >= self.expires_at {
            if self.state != EntryState::RefreshInProgress {
                self.state = EntryState::Expired;
            }
            return Freshness::Expired;
        }
        if now < self.refresh_after {
            return Freshness::Fresh;
        }
        match self.state {
            EntryState::RefreshInProgress => Freshness::Stale { claimed: false },
            EntryState::Fresh | EntryState::Expired => {
                self.state = EntryState::RefreshInProgress;
                Freshness::Stale { claimed: true }
            }
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Push the next refresh out after a failed attempt.
    ///
    /// The delay doubles with each consecutive failure, starting at `base`.
    pub fn back_off(&mut self, now: Instant, base: Duration) {
        self.refresh_failures = self.refresh_failures.saturating_add(1);
        let exponent = (self.refresh_failures - 1).min(16);
        let delay = base.saturating_mul(1u32 << exponent);
        self.refresh_after = deadline(now, delay);
        self.state = if self.is_expired(now) {
            EntryState::Expired
        } else {
            EntryState::Fresh
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifetime(ttl_ms: u64, refresh_ms: Option<u64>) -> Lifetime {
        Lifetime {
            ttl: Duration::from_millis(ttl_ms),
            refresh_delay: refresh_ms.map(Duration::from_millis),
        }
    }

    #[test]
    fn classifies_by_timestamps() {
        let now = Instant::now();
        let mut entry = Entry::new(Arc::new(1), now, lifetime(1000, Some(100)), 0);

        assert_eq!(entry.touch(now + Duration::from_millis(50)), Freshness::Fresh);
        assert_eq!(
            entry.touch(now + Duration::from_millis(150)),
            Freshness::Stale { claimed: true }
        );
        assert_eq!(entry.state, EntryState::RefreshInProgress);
        // Only the first stale reader claims the refresh.
        assert_eq!(
            entry.touch(now + Duration::from_millis(160)),
            Freshness::Stale { claimed: false }
        );
        assert_eq!(entry.touch(now + Duration::from_millis(1000)), Freshness::Expired);
        assert_eq!(entry.access_count, 4);
    }

    #[test]
    fn without_early_refresh_entries_go_straight_to_expired() {
        let now = Instant::now();
        let mut entry = Entry::new(Arc::new(1), now, lifetime(1000, None), 0);
        assert_eq!(entry.touch(now + Duration::from_millis(999)), Freshness::Fresh);
        assert_eq!(entry.touch(now + Duration::from_millis(1000)), Freshness::Expired);
        assert_eq!(entry.state, EntryState::Expired);
    }

    #[test]
    fn refresh_delay_is_capped_at_expiry() {
        let now = Instant::now();
        let entry = Entry::new(Arc::new(1), now, lifetime(100, Some(500)), 0);
        assert_eq!(entry.refresh_after, entry.expires_at);
    }

    #[test]
    fn back_off_doubles_each_failure() {
        let now = Instant::now();
        let base = Duration::from_millis(10);
        let mut entry = Entry::new(Arc::new(1), now, lifetime(10_000, Some(0)), 0);

        entry.back_off(now, base);
        assert_eq!(entry.refresh_after, now + Duration::from_millis(10));
        entry.back_off(now, base);
        assert_eq!(entry.refresh_after, now + Duration::from_millis(20));
        entry.back_off(now, base);
        assert_eq!(entry.refresh_after, now + Duration::from_millis(40));
        assert_eq!(entry.refresh_failures, 3);
        assert_eq!(entry.state, EntryState::Fresh);
    }

    #[test]
    fn unbounded_ttl_saturates() {
        let now = Instant::now();
        let lifetime = Lifetime {
            ttl: Duration::MAX,
            refresh_delay: Some(Duration::MAX),
        };
        let mut entry = Entry::new(Arc::new(1), now, lifetime, 0);

        assert!(entry.expires_at > now + Duration::from_secs(86_400 * 365));
        assert_eq!(entry.refresh_after, entry.expires_at);
        assert_eq!(entry.touch(now + Duration::from_secs(3_600)), Freshness::Fresh);
    }

    #[test]
    fn huge_backoff_saturates_and_releases_the_claim() {
        let now = Instant::now();
        let mut entry = Entry::new(Arc::new(1), now, lifetime(10_000, Some(0)), 0);
        assert_eq!(entry.touch(now), Freshness::Stale { claimed: true });

        entry.back_off(now, Duration::from_secs(u64::MAX / 2));
        entry.back_off(now, Duration::from_secs(u64::MAX / 2));
        assert_eq!(entry.state, EntryState::Fresh);
        assert!(entry.refresh_after > entry.expires_at);
        assert_eq!(entry.refresh_failures, 2);
    }
}
