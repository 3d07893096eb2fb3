//! Request coalescing for origin fetches
//!
//! The first caller for a key becomes the leader: its fetch is registered as
//! in-flight and spawned onto its own task. Every caller, leader included,
//! then waits on the same completion signal. Because the fetch does not run
//! on the leader's future, dropping that future (a cancelled request) never
//! strands the followers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::CacheError;

pub(crate) type FetchResult<V> = Result<Arc<V>, CacheError>;

type InFlightReceiver<V> = watch::Receiver<Option<FetchResult<V>>>;
type InFlightSender<V> = watch::Sender<Option<FetchResult<V>>>;
type InFlightMap<V> = Arc<Mutex<HashMap<String, InFlight<V>>>>;

/// An in-flight fetch that other requests can wait on
struct InFlight<V> {
    rx: InFlightReceiver<V>,
    waiters: Arc<AtomicUsize>,
}

/// Guard that ensures in-flight entries are cleaned up even on panic.
///
/// When dropped, removes the key from the in-flight map and notifies waiters
/// with an error if no result was sent.
struct InFlightGuard<V> {
    key: String,
    in_flight: InFlightMap<V>,
    tx: Option<InFlightSender<V>>,
}

impl<V> InFlightGuard<V> {
    /// Complete the fetch with a result, consuming the guard.
    fn complete(mut self, result: FetchResult<V>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        // tx is still set only if the fetch task panicked before completing.
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Err(CacheError::Cancelled)));
        }
        self.in_flight.lock().remove(&self.key);
    }
}

/// Single-flight table keyed by cache key.
pub(crate) struct Coordinator<V> {
    in_flight: InFlightMap<V>,
}

impl<V> Coordinator<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a fetch for `key` is currently running.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Number of keys with a running fetch.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Number of callers attached to the running fetch for `key`, leader excluded.
    pub fn waiters(&self, key: &str) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map_or(0, |f| f.waiters.load(Ordering::Relaxed))
    }

    /// Run `work` for `key` unless a fetch for it is already running, and wait for the result.
    ///
    /// Every concurrent caller for the same key receives the leader's result.
    /// `slow_after` only controls when a long wait gets logged; the wait itself
    /// is not bounded.
    pub async fn coalesce<F, Fut>(
        &self,
        key: &str,
        work: F,
        slow_after: Option<Duration>,
    ) -> FetchResult<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FetchResult<V>> + Send + 'static,
    {
        let (mut receivers, mut guards) = self.register([key.to_owned()]);

        if let Some(guard) = guards.pop() {
            debug!("Starting coalesced fetch for key: {}", key);
            tokio::spawn(async move {
                let result = work().await;
                guard.complete(result);
            });
        } else {
            debug!("Waiting for in-flight fetch for key: {}", key);
        }

        match receivers.pop() {
            Some((key, rx)) => wait(rx, &key, slow_after).await,
            None => Err(CacheError::Cancelled),
        }
    }

    /// Batch variant of [`coalesce`](Self::coalesce).
    ///
    /// Keys already in flight are awaited; the rest are handed to a single
    /// `work` call. Keys missing from a successful batch resolve to
    /// [`CacheError::NotFound`]; a failed batch resolves every key it owned
    /// to the same error.
    pub async fn coalesce_batch<F, Fut>(
        &self,
        keys: Vec<String>,
        work: F,
        slow_after: Option<Duration>,
    ) -> HashMap<String, FetchResult<V>>
    where
        F: FnOnce(Vec<String>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HashMap<String, Arc<V>>, CacheError>> + Send + 'static,
    {
        let (receivers, guards) = self.register(keys);

        if !guards.is_empty() {
            let owned: Vec<String> = guards.iter().map(|g| g.key.clone()).collect();
            debug!("Starting coalesced batch fetch for {} keys", owned.len());
            tokio::spawn(async move {
                match work(owned).await {
                    Ok(mut values) => {
                        for guard in guards {
                            let result = values.remove(&guard.key).ok_or(CacheError::NotFound);
                            guard.complete(result);
                        }
                    }
                    Err(e) => {
                        for guard in guards {
                            guard.complete(Err(e.clone()));
                        }
                    }
                }
            });
        }

        join_all(receivers.into_iter().map(|(key, rx)| async move {
            let result = wait(rx, &key, slow_after).await;
            (key, result)
        }))
        .await
        .into_iter()
        .collect()
    }

    /// Attach to running fetches, or register new ones for keys that have none.
    ///
    /// Returns one receiver per distinct key plus a guard for each key this
    /// caller now leads.
    #[allow(clippy::type_complexity)]
    fn register<I>(&self, keys: I) -> (Vec<(String, InFlightReceiver<V>)>, Vec<InFlightGuard<V>>)
    where
        I: IntoIterator<Item = String>,
    {
        let mut receivers = Vec::new();
        let mut guards = Vec::new();

        let mut in_flight = self.in_flight.lock();
        for key in keys {
            if receivers.iter().any(|(k, _)| *k == key) {
                continue;
            }
            if let Some(existing) = in_flight.get(&key) {
                existing.waiters.fetch_add(1, Ordering::Relaxed);
                receivers.push((key, existing.rx.clone()));
                continue;
            }

            let (tx, rx) = watch::channel(None);
            in_flight.insert(
                key.clone(),
                InFlight {
                    rx: rx.clone(),
                    waiters: Arc::new(AtomicUsize::new(0)),
                },
            );
            guards.push(InFlightGuard {
                key: key.clone(),
                in_flight: Arc::clone(&self.in_flight),
                tx: Some(tx),
            });
            receivers.push((key, rx));
        }
        drop(in_flight);

        (receivers, guards)
    }
}

/// Wait for an in-flight fetch to publish its result.
async fn wait<V>(
    mut rx: InFlightReceiver<V>,
    key: &str,
    slow_after: Option<Duration>,
) -> FetchResult<V> {
    let outcome = async move {
        loop {
            let current = rx.borrow().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(CacheError::Cancelled);
            }
        }
    };

    let Some(delay) = slow_after else {
        return outcome.await;
    };

    tokio::pin!(outcome);
    match tokio::time::timeout(delay, &mut outcome).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Fetch for key {} has not completed after {:?}; still waiting",
                key, delay
            );
            outcome.await
        }
    }
}
