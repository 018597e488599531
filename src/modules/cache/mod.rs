//! Single-flight TTL cache.
//!
//! Values expire either by wall-clock TTL or by a use budget. A lookup that
//! misses hands the caller the entry lock as a [`CacheMiss`] guard; every other
//! caller on the same key queues behind it. Once the guard stores a value (or is
//! released without one) the next queued caller re-checks the entry: it either
//! receives the freshly stored value or a miss of its own, in which case it is
//! now responsible for recomputing.
//!
//! The structural map lock is only held while looking up or creating an entry,
//! so a slow recomputation for one key never blocks unrelated keys.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as EntryLock, OwnedMutexGuard};

#[derive(Debug)]
struct CacheEntry<V> {
    value: Option<V>,
    expires_at: Option<Instant>,
    uses_left: Option<u32>,
}

impl<V> Default for CacheEntry<V> {
    fn default() -> Self {
        Self {
            value: None,
            expires_at: None,
            uses_left: None,
        }
    }
}

impl<V: Clone> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.value.is_some()
            && self.expires_at.is_none_or(|at| now < at)
            && self.uses_left.is_none_or(|left| left > 0)
    }

    /// Returns the value and spends one use, or `None` after dropping a stale value.
    fn take_use(&mut self, now: Instant) -> Option<V> {
        if !self.is_live(now) {
            self.value = None;
            return None;
        }

        if let Some(left) = self.uses_left.as_mut() {
            *left -= 1;
        }
        self.value.clone()
    }

    fn store(&mut self, value: V, ttl: Duration, use_limit: u32) {
        self.value = Some(value);
        self.expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.uses_left = (use_limit > 0).then_some(use_limit);
    }
}

type Slot<V> = Arc<EntryLock<CacheEntry<V>>>;

/// Outcome of [`SingleFlightCache::get_or_lock`].
pub enum Lookup<V> {
    /// A live value; one use has been spent and the entry lock released.
    Hit(V),
    /// No usable value; the caller owns the entry lock until the guard is
    /// stored into, unlocked or dropped.
    Miss(CacheMiss<V>),
}

impl<V> Lookup<V> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }
}

impl<V> fmt::Debug for Lookup<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Hit(_) => f.write_str("Hit(..)"),
            Lookup::Miss(miss) => write!(f, "Miss({})", miss.key),
        }
    }
}

/// Exclusive hold on one cache key after a miss.
///
/// Dropping the guard releases the key without storing anything, so early
/// returns and `?` on error paths can never wedge the key.
pub struct CacheMiss<V> {
    key: String,
    entry: OwnedMutexGuard<CacheEntry<V>>,
}

impl<V: Clone> CacheMiss<V> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stores `value` and releases the key. A zero `ttl` never expires, a zero
    /// `use_limit` allows unlimited reads.
    pub fn put(mut self, value: V, ttl: Duration, use_limit: u32) {
        self.entry.store(value, ttl, use_limit);
    }

    /// Releases the key without storing.
    pub fn unlock(self) {}
}

/// Generic key/value cache with TTL, use-count expiry and per-key mutual
/// exclusion.
pub struct SingleFlightCache<V> {
    entries: Mutex<HashMap<String, Slot<V>>>,
    generation: AtomicU64,
}

impl<V: Clone + Send + 'static> SingleFlightCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn slot(&self, key: &str) -> Slot<V> {
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(EntryLock::new(CacheEntry::default())))
            .clone()
    }

    /// Returns a live value, or a miss that holds the key's lock.
    ///
    /// Waits while another caller holds the key. When that caller stores a
    /// value this lookup observes it instead of recomputing.
    pub async fn get_or_lock(&self, key: &str) -> Lookup<V> {
        let mut entry = self.slot(key).lock_owned().await;

        match entry.take_use(Instant::now()) {
            Some(value) => Lookup::Hit(value),
            None => Lookup::Miss(CacheMiss {
                key: key.to_string(),
                entry,
            }),
        }
    }

    /// Stores a value without a prior miss, waiting for the key if it is held.
    pub async fn put(&self, key: &str, value: V, ttl: Duration, use_limit: u32) {
        let mut entry = self.slot(key).lock_owned().await;
        entry.store(value, ttl, use_limit);
    }

    /// Removes and returns the current value, live or not.
    pub async fn clear(&self, key: &str) -> Option<V> {
        let mut entry = self.slot(key).lock_owned().await;
        entry.value.take()
    }

    /// Remaining reads for a live value, `None` when the budget is unlimited.
    pub async fn uses_left(&self, key: &str) -> Option<u32> {
        let entry = self.slot(key).lock_owned().await;
        if entry.is_live(Instant::now()) {
            entry.uses_left
        } else {
            Some(0)
        }
    }

    /// Drops every entry. Keys currently held by a [`CacheMiss`] keep their
    /// guard but the stored result is discarded with the old entry.
    pub fn destroy(&self) {
        let mut guard = self.entries.lock().expect("cache lock poisoned");
        guard.clear();
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of times [`destroy`](Self::destroy) has run.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + 'static> Default for SingleFlightCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for SingleFlightCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn expect_miss(lookup: Lookup<String>) -> CacheMiss<String> {
        match lookup {
            Lookup::Miss(miss) => miss,
            Lookup::Hit(value) => panic!("expected miss, got {value}"),
        }
    }

    #[tokio::test]
    async fn use_limit_exhausts_value() {
        let cache = SingleFlightCache::new();
        let miss = expect_miss(cache.get_or_lock("k").await);
        miss.put("v".to_string(), Duration::from_secs(1), 2);

        assert!(matches!(cache.get_or_lock("k").await, Lookup::Hit(ref v) if v == "v"));
        assert!(matches!(cache.get_or_lock("k").await, Lookup::Hit(ref v) if v == "v"));
        let third = expect_miss(cache.get_or_lock("k").await);
        third.unlock();
    }

    #[tokio::test]
    async fn ttl_expires_value() {
        let cache = SingleFlightCache::new();
        cache
            .put("k", "v".to_string(), Duration::from_millis(50), 0)
            .await;
        assert!(cache.get_or_lock("k").await.is_hit());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.get_or_lock("k").await.is_hit());
    }

    #[tokio::test]
    async fn zero_ttl_and_limit_are_unbounded() {
        let cache = SingleFlightCache::new();
        cache.put("k", "v".to_string(), Duration::ZERO, 0).await;
        for _ in 0..50 {
            assert!(cache.get_or_lock("k").await.is_hit());
        }
        assert_eq!(cache.uses_left("k").await, None);
    }

    #[tokio::test]
    async fn dropped_miss_releases_key() {
        let cache = SingleFlightCache::<String>::new();
        {
            let _miss = expect_miss(cache.get_or_lock("k").await);
        }
        let again = tokio::time::timeout(Duration::from_secs(1), cache.get_or_lock("k"))
            .await
            .expect("key stayed locked");
        assert!(!again.is_hit());
    }

    #[tokio::test]
    async fn waiters_observe_value_stored_by_holder() {
        let cache = Arc::new(SingleFlightCache::<String>::new());
        let computations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let computations = computations.clone();
            handles.push(tokio::spawn(async move {
                match cache.get_or_lock("hot").await {
                    Lookup::Hit(value) => value,
                    Lookup::Miss(miss) => {
                        computations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        miss.put("fresh".to_string(), Duration::from_secs(60), 0);
                        "fresh".to_string()
                    }
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "fresh");
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_recomputes_when_holder_unlocks_without_storing() {
        let cache = Arc::new(SingleFlightCache::<String>::new());
        let first = expect_miss(cache.get_or_lock("k").await);

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_lock("k").await.is_hit() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        first.unlock();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn slow_key_does_not_block_other_keys() {
        let cache = SingleFlightCache::<String>::new();
        let _held = expect_miss(cache.get_or_lock("slow").await);
        cache.put("other", "v".to_string(), Duration::ZERO, 0).await;

        let lookup = tokio::time::timeout(Duration::from_secs(1), cache.get_or_lock("other"))
            .await
            .expect("unrelated key blocked");
        assert!(lookup.is_hit());
    }

    #[tokio::test]
    async fn clear_returns_prior_value() {
        let cache = SingleFlightCache::new();
        cache.put("k", "v".to_string(), Duration::ZERO, 0).await;
        assert_eq!(cache.clear("k").await.as_deref(), Some("v"));
        assert_eq!(cache.clear("k").await, None);
        assert!(!cache.get_or_lock("k").await.is_hit());
    }

    #[tokio::test]
    async fn destroy_drops_entries_and_bumps_generation() {
        let cache = SingleFlightCache::new();
        cache.put("a", "1".to_string(), Duration::ZERO, 0).await;
        cache.put("b", "2".to_string(), Duration::ZERO, 0).await;
        assert_eq!(cache.len(), 2);

        cache.destroy();
        assert!(cache.is_empty());
        assert_eq!(cache.generation(), 1);
        assert!(!cache.get_or_lock("a").await.is_hit());
    }
}
