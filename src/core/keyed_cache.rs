//! Keyed lazy cache with per-key load coordination and LRU eviction
//!
//! Structure:
//! - `entries`: LruCache<K, CacheEntry<V>> behind a short-held Mutex (structural changes only)
//! - `load_locks`: one [`LoadSlot`] per key, created lazily on a miss and
//!   dropped once no caller or loader holds it
//!
//! Loaders run outside the structural lock, so a slow load never blocks lookups
//! of other keys. Concurrent misses on the same key collapse into one loader
//! call: the second caller waits on the key slot, then re-checks the map.
//!
//! With a load timeout the slot guard travels with the loader to its helper
//! thread. A caller that gave up returns `Timeout`, but the key stays busy
//! until the detached loader actually finishes.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use log::{debug, trace, warn};
use lru::LruCache;
use serde::Serialize;

use super::error::ResourceError;

/// Number of load-time samples kept for `avg_load_time`
const LOAD_SAMPLES: usize = 50;

/// Result of a loader call: `Ok(None)` is an empty result and is never cached.
pub type LoadResult<V> = Result<Option<V>, ResourceError>;

/// Cached value plus its last access time
#[derive(Debug)]
struct CacheEntry<V> {
    value: Arc<V>,
    last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: Arc<V>) -> Self {
        Self {
            value,
            last_access: Instant::now(),
        }
    }

    fn touch(&mut self) -> Arc<V> {
        self.last_access = Instant::now();
        Arc::clone(&self.value)
    }
}

/// Per-key load slot. Unlike a `MutexGuard`, its guard can move to another thread.
#[derive(Debug, Default)]
struct LoadSlot {
    busy: Mutex<bool>,
    freed: Condvar,
}

impl LoadSlot {
    fn acquire(self: &Arc<Self>) -> SlotGuard {
        let mut busy = lock(&self.busy);
        while *busy {
            busy = self.freed.wait(busy).unwrap_or_else(|e| e.into_inner());
        }
        *busy = true;
        SlotGuard(Arc::clone(self))
    }
}

/// Exclusive right to run the loader for one key; released on drop
#[derive(Debug)]
struct SlotGuard(Arc<LoadSlot>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        *lock(&self.0.busy) = false;
        self.0.freed.notify_one();
    }
}

/// Hit/miss counters
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of cache occupancy and performance
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    /// size / capacity, in percent
    pub utilization_pct: f64,
    /// hits / (hits + misses), in percent
    pub hit_rate_pct: f64,
    pub hits: u64,
    pub misses: u64,
    pub avg_load_time: Duration,
}

/// Thread-safe lazy cache
///
/// `get(key, loader)` returns the cached value or runs `loader` exactly once
/// per key while callers are waiting on it. Failed or empty loads are not
/// cached, so the next `get` retries immediately.
pub struct KeyedCache<K, V> {
    name: &'static str,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    load_locks: Mutex<HashMap<K, Arc<LoadSlot>>>,
    capacity: AtomicUsize,
    counters: Counters,
    load_samples: Mutex<VecDeque<Duration>>,
    load_timeout: Option<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<K, V> KeyedCache<K, V>
where
    K: Hash + Eq + Clone + Debug,
    V: Send + Sync + 'static,
{
    /// Create cache holding at most `capacity` entries (min 1)
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        debug!("{} cache created: capacity={}", name, capacity);

        Self {
            name,
            entries: Mutex::new(LruCache::unbounded()),
            load_locks: Mutex::new(HashMap::new()),
            capacity: AtomicUsize::new(capacity),
            counters: Counters::default(),
            load_samples: Mutex::new(VecDeque::with_capacity(LOAD_SAMPLES)),
            load_timeout: None,
        }
    }

    /// Bound every loader call; past the deadline `get` returns `ResourceError::Timeout`.
    pub fn with_load_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.load_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Get value for `key`, loading it with `loader` on a miss.
    pub fn get<F>(&self, key: &K, loader: F) -> LoadResult<Arc<V>>
    where
        F: FnOnce() -> LoadResult<V> + Send + 'static,
    {
        if let Some(value) = self.lookup(key) {
            self.counters.record_hit();
            return Ok(Some(value));
        }
        self.counters.record_miss();

        let outcome = self.load_exclusive(key, loader);
        // Keys that were not stored keep no slot behind
        self.release_locks(std::slice::from_ref(key));
        outcome
    }

    /// Miss path: hold the key slot across re-check, load and insert
    fn load_exclusive<F>(&self, key: &K, loader: F) -> LoadResult<Arc<V>>
    where
        F: FnOnce() -> LoadResult<V> + Send + 'static,
    {
        let slot = self.key_lock(key).acquire();

        // Another caller may have finished this load while we waited
        if let Some(value) = self.lookup(key) {
            trace!("{} cache: {:?} loaded by concurrent caller", self.name, key);
            return Ok(Some(value));
        }

        let started = Instant::now();
        let (outcome, _slot) = self.run_loader(loader, slot);
        self.record_load_time(started.elapsed());

        match outcome {
            Ok(Some(value)) => {
                let value = Arc::new(value);
                self.insert(key.clone(), Arc::clone(&value));
                Ok(Some(value))
            }
            Ok(None) => {
                debug!("{} cache: empty result for {:?}, not cached", self.name, key);
                Ok(None)
            }
            Err(e) => {
                warn!("{} cache: load failed for {:?}: {}", self.name, key, e);
                Err(e)
            }
        }
    }

    /// Check presence without touching recency or stats
    pub fn contains(&self, key: &K) -> bool {
        lock(&self.entries).contains(key)
    }

    /// Time since `key` was last returned, if cached
    pub fn idle_for(&self, key: &K) -> Option<Duration> {
        lock(&self.entries).peek(key).map(|e| e.last_access.elapsed())
    }

    pub fn remove(&self, key: &K) -> bool {
        let removed = lock(&self.entries).pop(key).is_some();
        if removed {
            self.release_locks(std::slice::from_ref(key));
            debug!("{} cache: removed {:?}", self.name, key);
        }
        removed
    }

    /// Drop every entry and reset statistics
    pub fn clear(&self) {
        let count = {
            let mut entries = lock(&self.entries);
            let count = entries.len();
            entries.clear();
            count
        };
        lock(&self.load_locks).retain(|_, l| Arc::strong_count(l) > 1);
        self.counters.reset();
        lock(&self.load_samples).clear();

        if count > 0 {
            debug!("{} cache cleared: {} entries", self.name, count);
        }
    }

    /// Keys ordered most-recently-used first
    pub fn keys_by_recency(&self) -> Vec<K> {
        lock(&self.entries).iter().map(|(k, _)| k.clone()).collect()
    }

    /// Keep `pinned` plus the `keep - 1` most recently used other entries.
    ///
    /// Returns number of evicted entries.
    pub fn retain_recent(&self, pinned: &K, keep: usize) -> usize {
        let evicted: Vec<K> = {
            let mut entries = lock(&self.entries);
            let mut budget = keep.saturating_sub(1);
            let victims: Vec<K> = entries
                .iter()
                .filter(|(k, _)| *k != pinned)
                .filter_map(|(k, _)| {
                    if budget > 0 {
                        budget -= 1;
                        None
                    } else {
                        Some(k.clone())
                    }
                })
                .collect();
            for k in &victims {
                entries.pop(k);
            }
            victims
        };

        if !evicted.is_empty() {
            self.release_locks(&evicted);
            debug!(
                "{} cache: retained {} recent entries, evicted {}",
                self.name,
                self.len(),
                evicted.len()
            );
        }
        evicted.len()
    }

    /// Change capacity, evicting LRU entries if now over it
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let old = self.capacity.swap(capacity, Ordering::Relaxed);
        if old != capacity {
            debug!("{} cache capacity: {} -> {}", self.name, old, capacity);
            self.evict_over_capacity();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    pub fn get_stats(&self) -> CacheStats {
        let size = self.len();
        let capacity = self.capacity();
        let hits = self.counters.hits();
        let misses = self.counters.misses();
        let total = hits + misses;

        let avg_load_time = {
            let samples = lock(&self.load_samples);
            if samples.is_empty() {
                Duration::ZERO
            } else {
                samples.iter().sum::<Duration>() / samples.len() as u32
            }
        };

        CacheStats {
            size,
            capacity,
            utilization_pct: size as f64 / capacity as f64 * 100.0,
            hit_rate_pct: if total == 0 { 0.0 } else { hits as f64 / total as f64 * 100.0 },
            hits,
            misses,
            avg_load_time,
        }
    }

    // ===== internals =====

    fn lookup(&self, key: &K) -> Option<Arc<V>> {
        lock(&self.entries).get_mut(key).map(CacheEntry::touch)
    }

    fn key_lock(&self, key: &K) -> Arc<LoadSlot> {
        let mut locks = lock(&self.load_locks);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Drop per-key locks nobody is waiting on
    fn release_locks(&self, keys: &[K]) {
        let mut locks = lock(&self.load_locks);
        for key in keys {
            let unused = locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1);
            if unused {
                locks.remove(key);
            }
        }
    }

    fn insert(&self, key: K, value: Arc<V>) {
        {
            let mut entries = lock(&self.entries);
            entries.put(key.clone(), CacheEntry::new(value));
        }
        debug!("{} cache: stored {:?}", self.name, key);
        self.evict_over_capacity();
    }

    fn evict_over_capacity(&self) {
        let evicted: Vec<K> = {
            let mut entries = lock(&self.entries);
            let capacity = self.capacity();
            let mut evicted = Vec::new();
            while entries.len() > capacity {
                match entries.pop_lru() {
                    Some((k, _)) => evicted.push(k),
                    None => break,
                }
            }
            evicted
        };

        if !evicted.is_empty() {
            debug!("{} cache: LRU evicted {:?}", self.name, evicted);
            self.release_locks(&evicted);
        }
    }

    fn record_load_time(&self, elapsed: Duration) {
        let mut samples = lock(&self.load_samples);
        if samples.len() == LOAD_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    /// Run `loader`, bounded by the load timeout if set.
    ///
    /// The slot comes back with the result; on timeout it stays with the
    /// helper thread and is released when the loader returns.
    fn run_loader<F>(&self, loader: F, slot: SlotGuard) -> (LoadResult<V>, Option<SlotGuard>)
    where
        F: FnOnce() -> LoadResult<V> + Send + 'static,
    {
        let Some(timeout) = self.load_timeout else {
            return (catch_loader(loader), Some(slot));
        };

        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new()
            .name(format!("{}-load", self.name))
            .spawn(move || {
                let result = catch_loader(loader);
                // Receiver gone: the caller timed out and the slot drops here
                let _ = tx.send((result, slot));
            });
        if let Err(e) = spawned {
            let err = ResourceError::LoadFailure(format!("Failed to spawn loader thread: {}", e));
            return (Err(err), None);
        }

        match rx.recv_timeout(timeout) {
            Ok((result, slot)) => (result, Some(slot)),
            Err(RecvTimeoutError::Timeout) => {
                debug!("{} cache: loader still running after {:?}, detached", self.name, timeout);
                (Err(ResourceError::Timeout(timeout)), None)
            }
            Err(RecvTimeoutError::Disconnected) => (
                Err(ResourceError::LoadFailure("Loader thread exited without a result".to_string())),
                None,
            ),
        }
    }
}

/// Run loader, converting a panic into `LoadFailure`
fn catch_loader<V, F>(loader: F) -> LoadResult<V>
where
    F: FnOnce() -> LoadResult<V>,
{
    panic::catch_unwind(AssertUnwindSafe(loader)).unwrap_or_else(|payload| {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "loader panicked".to_string());
        Err(ResourceError::LoadFailure(msg))
    })
}

impl<K, V> std::fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCache")
            .field("name", &self.name)
            .field("capacity", &self.capacity.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
