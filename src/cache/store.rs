//! Cache storage.
//!
//! [`CacheStore`] owns the mapping from [`CacheKey`] to [`CacheEntry`]. It is
//! the only mutable state shared by query and mutation runners; every change
//! goes through `set`, `invalidate`, `evict_expired` or `remove`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::events::{CacheEvent, EventBus, EventKind};
use super::keys::CacheKey;
use super::lock::{mutex_lock, rw_read, rw_write};

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT_TOTAL: &str = "lectern_cache_evict_total";
const METRIC_CACHE_INVALIDATE_TOTAL: &str = "lectern_cache_invalidate_total";

type ObserverCounts = Arc<Mutex<HashMap<CacheKey, usize>>>;

/// In-memory store of cached query results.
///
/// Entries live in a sorted map so prefix operations are a range scan rather
/// than a walk over every key.
pub struct CacheStore<T> {
    entries: RwLock<BTreeMap<CacheKey, CacheEntry<T>>>,
    observers: ObserverCounts,
    events: EventBus,
    revision: AtomicU64,
    /// Revision of the latest invalidation of each prefix.
    invalidations: RwLock<BTreeMap<CacheKey, u64>>,
}

impl<T> CacheStore<T> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            observers: Arc::new(Mutex::new(HashMap::new())),
            events: EventBus::new(config.event_capacity_non_zero()),
            revision: AtomicU64::new(0),
            invalidations: RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up an entry regardless of freshness.
    ///
    /// An entry past its collection horizon with no observers is evicted here
    /// and reported as absent.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<T>> {
        let now = Instant::now();
        {
            let entries = rw_read(&self.entries, SOURCE, "get");
            let entry = entries.get(key)?;
            if !entry.is_collectable_at(now) || self.is_observed(key) {
                return Some(entry.clone());
            }
        }

        let mut entries = rw_write(&self.entries, SOURCE, "get.evict");
        let entry = entries.get(key)?;
        if !entry.is_collectable_at(now) || self.is_observed(key) {
            return Some(entry.clone());
        }

        entries.remove(key);
        drop(entries);
        self.report_evicted(std::slice::from_ref(key));
        None
    }

    /// Insert or overwrite the entry for `key`, fetched now.
    pub fn set(
        &self,
        key: CacheKey,
        value: T,
        stale_time: Duration,
        gc_time: Duration,
    ) -> CacheEntry<T> {
        self.set_shared(key, Arc::new(value), stale_time, gc_time)
    }

    /// Like [`set`](Self::set) for a value that is already shared.
    pub fn set_shared(
        &self,
        key: CacheKey,
        value: Arc<T>,
        stale_time: Duration,
        gc_time: Duration,
    ) -> CacheEntry<T> {
        let entry = CacheEntry::new(value, Instant::now(), stale_time, gc_time);
        rw_write(&self.entries, SOURCE, "set").insert(key.clone(), entry.clone());
        self.events.publish(&key, EventKind::Updated);
        entry
    }

    /// Store the result of a fetch that started at store `revision`. When `key`
    /// was invalidated since, the value is stored already stale and `false` is
    /// returned.
    pub(crate) fn set_fetched(
        &self,
        key: CacheKey,
        value: Arc<T>,
        revision: u64,
        stale_time: Duration,
        gc_time: Duration,
    ) -> bool {
        let fresh = {
            let mut entries = rw_write(&self.entries, SOURCE, "set_fetched");
            let fresh = !self.invalidated_since(&key, revision);
            let stale_time = if fresh { stale_time } else { Duration::ZERO };
            entries.insert(
                key.clone(),
                CacheEntry::new(value, Instant::now(), stale_time, gc_time),
            );
            fresh
        };
        self.events.publish(&key, EventKind::Updated);
        fresh
    }

    /// Mark every entry whose key starts with `prefix` as stale.
    ///
    /// Values are kept so they can still be served while a refetch runs.
    /// Returns the number of entries touched.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let now = Instant::now();
        let mut invalidated = Vec::new();
        {
            let mut entries = rw_write(&self.entries, SOURCE, "invalidate");
            let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            rw_write(&self.invalidations, SOURCE, "invalidate.log")
                .insert(prefix.clone(), revision);
            for (key, entry) in entries.range_mut(prefix.clone()..) {
                if !key.starts_with(prefix) {
                    break;
                }
                entry.mark_stale(now);
                invalidated.push(key.clone());
            }
        }

        for key in &invalidated {
            self.events.publish(key, EventKind::Invalidated);
        }
        counter!(METRIC_CACHE_INVALIDATE_TOTAL).increment(invalidated.len() as u64);
        debug!(prefix = %prefix, invalidated = invalidated.len(), "Cache prefix invalidated");

        invalidated.len()
    }

    /// Current invalidation revision. A fetch that records it before starting
    /// can later ask [`invalidated_since`](Self::invalidated_since) whether a
    /// write superseded it.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Whether `key` or one of its prefixes was invalidated after `revision`.
    pub fn invalidated_since(&self, key: &CacheKey, revision: u64) -> bool {
        let invalidations = rw_read(&self.invalidations, SOURCE, "invalidated_since");
        (0..=key.len()).any(|len| {
            let prefix = CacheKey::new(key.segments()[..len].to_vec());
            invalidations
                .get(&prefix)
                .is_some_and(|invalidated_at| *invalidated_at > revision)
        })
    }

    /// Drop every unobserved entry whose collection horizon is at or before `now`.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut evicted = Vec::new();
        {
            let mut entries = rw_write(&self.entries, SOURCE, "evict_expired");
            let observers = mutex_lock(&self.observers, SOURCE, "evict_expired.observers");
            entries.retain(|key, entry| {
                let keep = !entry.is_collectable_at(now)
                    || observers.get(key).is_some_and(|count| *count > 0);
                if !keep {
                    evicted.push(key.clone());
                }
                keep
            });
        }

        self.report_evicted(&evicted);
        evicted.len()
    }

    /// Delete every entry under `prefix`, observed or not.
    pub fn remove(&self, prefix: &CacheKey) -> usize {
        let removed: Vec<CacheKey> = {
            let mut entries = rw_write(&self.entries, SOURCE, "remove");
            let keys: Vec<CacheKey> = entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        for key in &removed {
            self.events.publish(key, EventKind::Removed);
        }
        removed.len()
    }

    pub fn clear(&self) -> usize {
        self.remove(&CacheKey::root())
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached keys in sorted order.
    pub fn keys(&self) -> Vec<CacheKey> {
        rw_read(&self.entries, SOURCE, "keys").keys().cloned().collect()
    }

    /// Register an observer of `key`; the entry is not collected while the
    /// returned guard is alive.
    pub fn observe(&self, key: CacheKey) -> ObserverGuard {
        *mutex_lock(&self.observers, SOURCE, "observe")
            .entry(key.clone())
            .or_default() += 1;
        ObserverGuard {
            key,
            observers: Arc::clone(&self.observers),
        }
    }

    pub fn observer_count(&self, key: &CacheKey) -> usize {
        mutex_lock(&self.observers, SOURCE, "observer_count")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    fn is_observed(&self, key: &CacheKey) -> bool {
        self.observer_count(key) > 0
    }

    fn report_evicted(&self, keys: &[CacheKey]) {
        if keys.is_empty() {
            return;
        }
        for key in keys {
            self.events.publish(key, EventKind::Evicted);
        }
        counter!(METRIC_CACHE_EVICT_TOTAL).increment(keys.len() as u64);
        debug!(evicted = keys.len(), "Collected expired cache entries");
    }
}

impl<T> Default for CacheStore<T> {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

/// Keeps one observer registered for a key until dropped.
#[must_use = "the observer is released as soon as the guard is dropped"]
pub struct ObserverGuard {
    key: CacheKey,
    observers: ObserverCounts,
}

impl ObserverGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        let mut observers = mutex_lock(&self.observers, SOURCE, "observer_guard.drop");
        if let Some(count) = observers.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                observers.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache_key;

    const SECOND: Duration = Duration::from_secs(1);

    fn store() -> CacheStore<String> {
        CacheStore::default()
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_then_staleness_then_eviction() {
        let store = CacheStore::<u32>::default();
        let key = cache_key!["a"];
        store.set(key.clone(), 1, Duration::from_millis(1000), Duration::from_millis(5000));

        tokio::time::advance(Duration::from_millis(500)).await;
        let entry = store.get(&key).expect("entry at t=500");
        assert_eq!(**entry.value(), 1);
        assert!(entry.is_fresh_at(Instant::now()));

        tokio::time::advance(Duration::from_millis(1000)).await;
        let entry = store.get(&key).expect("entry at t=1500");
        assert_eq!(**entry.value(), 1);
        assert!(entry.is_stale_at(Instant::now()));

        tokio::time::advance(Duration::from_millis(4500)).await;
        assert!(store.get(&key).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_set_refreshes_timestamps() {
        let store = store();
        let key = cache_key!["admin", "categories", "all"];

        let first = store.set(key.clone(), "fr".to_string(), SECOND, 5 * SECOND);
        tokio::time::advance(Duration::from_millis(300)).await;
        let second = store.set(key.clone(), "fr".to_string(), SECOND, 5 * SECOND);

        let current = store.get(&key).expect("entry");
        assert_eq!(current.value(), second.value());
        assert_eq!(first.value(), second.value());
        assert!(current.fetched_at() > first.fetched_at());
        assert_eq!(current.fresh_until(), second.fresh_until());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_reaches_whole_prefix_family() {
        let store = store();
        let long = 60 * SECOND;
        store.set(cache_key!["admin", "articles", "all"], "list".into(), long, long);
        store.set(cache_key!["admin", "articles", "123"], "detail".into(), long, long);
        store.set(cache_key!["admin", "categories"], "cats".into(), long, long);

        let touched = store.invalidate(&cache_key!["admin", "articles"]);
        assert_eq!(touched, 2);

        let now = Instant::now();
        let list = store.get(&cache_key!["admin", "articles", "all"]).expect("list");
        let detail = store.get(&cache_key!["admin", "articles", "123"]).expect("detail");
        let cats = store.get(&cache_key!["admin", "categories"]).expect("categories");

        assert!(list.is_stale_at(now));
        assert!(detail.is_stale_at(now));
        assert!(cats.is_fresh_at(now));
        assert_eq!(list.value().as_str(), "list");
    }

    #[tokio::test(start_paused = true)]
    async fn observed_entries_survive_collection() {
        let store = store();
        let key = cache_key!["admin", "contacts", "all"];
        store.set(key.clone(), "contacts".into(), SECOND, 2 * SECOND);

        let guard = store.observe(key.clone());
        assert_eq!(store.observer_count(&key), 1);

        tokio::time::advance(10 * SECOND).await;
        assert_eq!(store.evict_expired(Instant::now()), 0);
        assert!(store.get(&key).is_some());

        drop(guard);
        assert_eq!(store.observer_count(&key), 0);
        assert_eq!(store.evict_expired(Instant::now()), 1);
        assert!(store.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_expired_only_touches_expired_entries() {
        let store = store();
        store.set(cache_key!["short"], "s".into(), SECOND, SECOND);
        store.set(cache_key!["long"], "l".into(), SECOND, 10 * SECOND);

        tokio::time::advance(2 * SECOND).await;
        assert_eq!(store.evict_expired(Instant::now()), 1);
        assert_eq!(store.keys(), vec![cache_key!["long"]]);
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let store = store();
        store.set(cache_key!["admin", "sessions", 1], "one".into(), SECOND, SECOND);
        store.set(cache_key!["admin", "sessions", 2], "two".into(), SECOND, SECOND);
        store.set(cache_key!["public", "catalogue"], "cat".into(), SECOND, SECOND);

        assert_eq!(store.remove(&cache_key!["admin", "sessions"]), 2);
        assert_eq!(store.keys(), vec![cache_key!["public", "catalogue"]]);

        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn changes_are_published() {
        let store = store();
        let mut events = store.subscribe();
        let key = cache_key!["admin", "formations", "all"];

        store.set(key.clone(), "f".into(), SECOND, SECOND);
        store.invalidate(&key);
        store.remove(&key);

        let kinds = [
            events.recv().await.expect("updated").kind,
            events.recv().await.expect("invalidated").kind,
            events.recv().await.expect("removed").kind,
        ];
        assert_eq!(
            kinds,
            [EventKind::Updated, EventKind::Invalidated, EventKind::Removed]
        );
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = store();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store.set(cache_key!["x"], "value".into(), SECOND, SECOND);
        assert!(store.get(&cache_key!["x"]).is_some());
    }

    #[test]
    fn invalidation_revisions_cover_descendants_only() {
        let store = store();
        let before = store.revision();

        store.invalidate(&cache_key!["admin", "articles"]);

        assert!(store.revision() > before);
        assert!(store.invalidated_since(&cache_key!["admin", "articles", "all"], before));
        assert!(store.invalidated_since(&cache_key!["admin", "articles"], before));
        assert!(!store.invalidated_since(&cache_key!["admin", "categories", "all"], before));
        assert!(!store.invalidated_since(&cache_key!["admin"], before));
        assert!(!store.invalidated_since(&cache_key!["admin", "articles", "all"], store.revision()));
    }

    #[test]
    fn lookups_share_the_read_lock() {
        let store = store();
        let key = cache_key!["admin", "contacts", "all"];
        store.set(key.clone(), "contacts".into(), SECOND, 60 * SECOND);

        let reader = store.entries.read().expect("entries lock should be acquired");
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let _ = sender.send(store.get(&key).map(|entry| entry.into_value()));
            });
            let looked_up = receiver.recv_timeout(std::time::Duration::from_secs(5));
            drop(reader);
            let value = looked_up.expect("lookup must not wait for the writer lock");
            assert_eq!(value.as_deref().map(String::as_str), Some("contacts"));
        });
    }
}
