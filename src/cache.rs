//! Time-bounded memoization in front of provider fetches.
//!
//! One `get_or_fetch` contract: a hit inside the entry's TTL returns the
//! stored value, a miss runs the fetch exactly once even under concurrent
//! callers (later callers wait on the first call's outcome), and a failed
//! fetch is never cached. Expiry is lazy; nothing sweeps in the background.
//! There is no size bound: the key space of a session (symbols x date
//! ranges) is small enough that unbounded growth is the accepted tradeoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use crate::error::FetchError;

/// Time source, injectable so TTL behavior is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).expect("advance overflow");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

type Outcome<V> = Option<Result<V, FetchError>>;

enum Slot<V> {
    /// A completed fetch with its expiry bookkeeping.
    Ready {
        value: V,
        stored_at: DateTime<Utc>,
        ttl: Duration,
    },
    /// A fetch in flight; waiters subscribe to the broadcast.
    Pending(watch::Receiver<Outcome<V>>),
}

/// Snapshot of cache activity counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that waited on another caller's in-flight fetch.
    pub coalesced: u64,
}

pub struct CacheStore<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

enum Action<V> {
    Hit(V),
    Wait(watch::Receiver<Outcome<V>>),
    Lead(watch::Sender<Outcome<V>>),
}

impl<V: Clone> CacheStore<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Return the cached value for `key` if fresh, otherwise run `fetch`.
    ///
    /// The fetch executes outside the map lock, so slow fetches on one key
    /// never block lookups on unrelated keys. At most one fetch per key is
    /// in flight; concurrent callers for the same key receive the leader's
    /// outcome, including its error. Errors are not cached, leaving the key
    /// eligible for immediate retry.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<V, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>>,
    {
        let action = {
            let mut slots = self.slots.lock().unwrap();
            match slots.get(key) {
                Some(Slot::Ready {
                    value,
                    stored_at,
                    ttl: entry_ttl,
                }) => {
                    if self.is_fresh(*stored_at, *entry_ttl) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        debug!(key, "cache hit");
                        Action::Hit(value.clone())
                    } else {
                        // Lazy expiry: drop the stale entry and lead a refetch.
                        slots.remove(key);
                        self.begin_lead(&mut slots, key)
                    }
                }
                Some(Slot::Pending(rx)) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(key, "coalescing onto in-flight fetch");
                    Action::Wait(rx.clone())
                }
                None => self.begin_lead(&mut slots, key),
            }
        };

        match action {
            Action::Hit(value) => Ok(value),
            Action::Wait(rx) => Self::await_leader(key, rx).await,
            Action::Lead(tx) => {
                let guard = PendingGuard {
                    store: self,
                    key: key.to_string(),
                };
                let outcome = fetch().await;
                {
                    let mut slots = self.slots.lock().unwrap();
                    match &outcome {
                        Ok(value) => {
                            slots.insert(
                                key.to_string(),
                                Slot::Ready {
                                    value: value.clone(),
                                    stored_at: self.clock.now(),
                                    ttl,
                                },
                            );
                        }
                        Err(err) => {
                            debug!(key, %err, "fetch failed; key left uncached");
                            slots.remove(key);
                        }
                    }
                }
                drop(guard);
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
        }
    }

    /// Current counter values.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }

    fn begin_lead(&self, slots: &mut HashMap<String, Slot<V>>, key: &str) -> Action<V> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache miss; leading fetch");
        let (tx, rx) = watch::channel(None);
        slots.insert(key.to_string(), Slot::Pending(rx));
        Action::Lead(tx)
    }

    fn is_fresh(&self, stored_at: DateTime<Utc>, ttl: Duration) -> bool {
        match self.clock.now().signed_duration_since(stored_at).to_std() {
            Ok(age) => age <= ttl,
            // Stored "in the future" only happens if the clock moved back;
            // treat as fresh rather than refetching in a loop.
            Err(_) => true,
        }
    }

    async fn await_leader(
        key: &str,
        mut rx: watch::Receiver<Outcome<V>>,
    ) -> Result<V, FetchError> {
        loop {
            let settled = rx.borrow().clone();
            if let Some(outcome) = settled {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Leader dropped without publishing; key is retryable.
                return Err(FetchError::aborted(key));
            }
        }
    }
}

/// Removes the pending slot if the leading fetch never publishes an outcome
/// (cancellation, panic). Ready slots are untouched.
struct PendingGuard<'a, V> {
    store: &'a CacheStore<V>,
    key: String,
}

impl<V> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        let mut slots = self.store.slots.lock().unwrap();
        if matches!(slots.get(&self.key), Some(Slot::Pending(_))) {
            slots.remove(&self.key);
        }
    }
}

/// Build a stable cache key from a provider name and request parameters.
/// Parameters are sorted so equivalent requests share a key.
pub fn cache_key(provider: &str, params: &[(&str, String)]) -> String {
    let mut sorted: Vec<&(&str, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    let digest = Sha256::digest(joined.as_bytes());
    format!("{provider}:{}", hex::encode(&digest[..16]))
}
