//! Bounded, evictable front cache with single-flight loading.
//!
//! A [`SharedCache`] is an explicit handle: every [`CachingBucket`] attached
//! to the same handle shares its entries, limits and statistics. How keys of
//! different buckets relate is decided by [`KeyScoping`]:
//!
//! - [`KeyScoping::PerBucket`] gives every attached bucket its own
//!   [`BucketScope`], so identical content cached through two buckets
//!   occupies two entries and one bucket can never observe another's content.
//! - [`KeyScoping::Shared`] keys entries by digest alone, so every attached
//!   bucket serves content cached through any other. All attached buckets
//!   must use the same hash function.
//!
//! Not-found outcomes are never cached. Concurrent loads of one key run the
//! loader once; every racer receives the same result or the same error.
//!
//! [`CachingBucket`]: crate::caching::CachingBucket

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::{Blob, Materialization};
use crate::error::{StoreError, StoreResult};

/// How cache entries of different buckets relate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyScoping {
    /// Entries are private to the bucket that cached them.
    #[default]
    PerBucket,
    /// Entries are keyed by digest alone and visible to every bucket.
    Shared,
}

/// Configuration for a shared cache and the buckets attached to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached blobs.
    pub max_entries: Option<usize>,
    /// Maximum total weight (payload bytes by default).
    pub max_weight: Option<u64>,
    /// Seconds an entry survives without being read.
    pub expire_after_access_secs: Option<u64>,
    /// Key scoping mode.
    pub scoping: KeyScoping,
    /// Forward every write to the backend, even for cached content.
    /// Defaults to `true` for shared scoping and `false` otherwise.
    pub always_write: Option<bool>,
    /// Keep cached payloads off-heap.
    pub direct: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Some(10_000),
            max_weight: None,
            expire_after_access_secs: None,
            scoping: KeyScoping::PerBucket,
            always_write: None,
            direct: false,
        }
    }
}

impl CacheConfig {
    /// An unbounded configuration with the given scoping.
    pub fn unbounded(scoping: KeyScoping) -> Self {
        Self {
            max_entries: None,
            scoping,
            ..Default::default()
        }
    }

    pub fn expire_after_access(&self) -> Option<Duration> {
        self.expire_after_access_secs.map(Duration::from_secs)
    }

    /// Effective write-through policy.
    pub fn always_write(&self) -> bool {
        self.always_write
            .unwrap_or(self.scoping == KeyScoping::Shared)
    }

    /// Where cached payloads live.
    pub fn materialization(&self) -> Materialization {
        if self.direct {
            Materialization::Direct
        } else {
            Materialization::Heap
        }
    }

    /// Reject limits that would make the cache unusable.
    pub fn validate(&self) -> StoreResult<()> {
        if self.max_entries == Some(0) {
            return Err(StoreError::Configuration(
                "max_entries must be at least 1".into(),
            ));
        }
        if self.max_weight == Some(0) {
            return Err(StoreError::Configuration(
                "max_weight must be at least 1".into(),
            ));
        }
        if self.expire_after_access_secs == Some(0) {
            return Err(StoreError::Configuration(
                "expire_after_access_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Identifier of one logical bucket within a per-bucket scoped cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketScope(u64);

/// Key of one cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// `None` under shared scoping.
    pub scope: Option<BucketScope>,
    pub key: ContentKey,
}

impl CacheKey {
    pub fn new(scope: Option<BucketScope>, key: ContentKey) -> Self {
        Self { scope, key }
    }
}

/// Outcome of a backend load.
#[derive(Clone, Debug)]
pub enum Lookup {
    Found(Blob),
    NotFound,
}

impl Lookup {
    pub fn into_option(self) -> Option<Blob> {
        match self {
            Self::Found(blob) => Some(blob),
            Self::NotFound => None,
        }
    }
}

impl From<Option<Blob>> for Lookup {
    fn from(blob: Option<Blob>) -> Self {
        match blob {
            Some(blob) => Self::Found(blob),
            None => Self::NotFound,
        }
    }
}

/// Computes the weight of a cache entry.
pub type Weigher = Arc<dyn Fn(&ContentKey, &Blob) -> u64 + Send + Sync>;

/// Cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Loader runs that completed, including not-found outcomes.
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub entries: usize,
    pub weight: u64,
}

impl CacheStats {
    /// Fraction of lookups served from the cache; 1.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot {
    blob: Blob,
    weight: u64,
    last_access: Instant,
}

struct CacheState {
    lru: LruCache<CacheKey, Slot>,
    total_weight: u64,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) -> Option<Slot> {
        let slot = self.lru.pop(key)?;
        self.total_weight -= slot.weight;
        Some(slot)
    }

    fn pop_lru(&mut self) -> Option<Slot> {
        let (_, slot) = self.lru.pop_lru()?;
        self.total_weight -= slot.weight;
        Some(slot)
    }
}

type Flight = Arc<OnceLock<StoreResult<Lookup>>>;

type LoadMarker = (usize, CacheKey);

thread_local! {
    /// Loads running on this thread, by cache and key.
    static ACTIVE_LOADS: RefCell<Vec<LoadMarker>> = const { RefCell::new(Vec::new()) };
}

/// Marks a load as running on the current thread until dropped.
struct LoadGuard {
    marker: LoadMarker,
}

impl LoadGuard {
    fn enter(marker: LoadMarker) -> Self {
        ACTIVE_LOADS.with(|active| active.borrow_mut().push(marker));
        Self { marker }
    }

    fn is_active(marker: &LoadMarker) -> bool {
        ACTIVE_LOADS.with(|active| active.borrow().contains(marker))
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        ACTIVE_LOADS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(pos) = active.iter().rposition(|m| *m == self.marker) {
                active.remove(pos);
            }
        });
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
}

struct CacheInner {
    config: CacheConfig,
    weigher: Weigher,
    state: Mutex<CacheState>,
    in_flight: Mutex<HashMap<CacheKey, Flight>>,
    counters: Counters,
    next_scope: AtomicU64,
    function: Mutex<Option<&'static HashFunction>>,
}

/// Handle on one cache shared by every bucket attached to it.
///
/// Cloning the handle shares the cache.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<CacheInner>,
}

impl SharedCache {
    /// Create a cache weighing entries by payload size.
    pub fn new(config: CacheConfig) -> StoreResult<Self> {
        Self::with_weigher(config, Arc::new(|_: &ContentKey, blob: &Blob| blob.size().unwrap_or(0)))
    }

    /// Create a cache with a custom weigher.
    pub fn with_weigher(config: CacheConfig, weigher: Weigher) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                config,
                weigher,
                state: Mutex::new(CacheState {
                    lru: LruCache::unbounded(),
                    total_weight: 0,
                }),
                in_flight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                next_scope: AtomicU64::new(0),
                function: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn scoping(&self) -> KeyScoping {
        self.inner.config.scoping
    }

    /// Register a bucket using `function` and return the scope its entries
    /// live under.
    ///
    /// Under shared scoping the first attached bucket fixes the hash function
    /// and buckets using another one are rejected.
    pub fn attach(&self, function: &'static HashFunction) -> StoreResult<Option<BucketScope>> {
        match self.scoping() {
            KeyScoping::PerBucket => {
                let id = self.inner.next_scope.fetch_add(1, Ordering::Relaxed);
                Ok(Some(BucketScope(id)))
            }
            KeyScoping::Shared => {
                let mut recorded = self.inner.function.lock();
                match *recorded {
                    Some(existing) if existing != function => Err(StoreError::Configuration(
                        format!("shared cache is keyed by {existing}, bucket uses {function}"),
                    )),
                    Some(_) => Ok(None),
                    None => {
                        *recorded = Some(function);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Return the cached blob for `key`, recording a hit or miss.
    pub fn get_if_present(&self, key: &CacheKey) -> Option<Blob> {
        let found = self.lookup(key);
        let counter = if found.is_some() {
            &self.inner.counters.hits
        } else {
            &self.inner.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Whether `key` is cached. Does not count as an access.
    pub fn is_resident(&self, key: &CacheKey) -> bool {
        let state = self.inner.state.lock();
        state
            .lru
            .peek(key)
            .is_some_and(|slot| !self.is_expired(slot, Instant::now()))
    }

    /// Return the cached blob for `key`, or run `load` to fetch it.
    ///
    /// Concurrent callers for the same key share one `load` run. A found
    /// blob is cached before any caller returns; not-found and failures are
    /// not cached.
    ///
    /// Caching layers stacked on one shared-scoped cache reach this method
    /// again for the same key from inside the outer layer's `load`. That
    /// nested call runs its own `load` directly and leaves caching to the
    /// outer call.
    pub fn get_or_load<F>(&self, key: CacheKey, load: F) -> StoreResult<Lookup>
    where
        F: FnOnce() -> StoreResult<Lookup>,
    {
        if let Some(blob) = self.get_if_present(&key) {
            return Ok(Lookup::Found(blob));
        }
        let marker = (self.id(), key);
        if LoadGuard::is_active(&marker) {
            return load();
        }
        let flight = {
            let mut flights = self.inner.in_flight.lock();
            match flights.get(&key) {
                Some(flight) => Arc::clone(flight),
                None => {
                    // A load may have completed between the miss and the lock.
                    if let Some(blob) = self.lookup(&key) {
                        return Ok(Lookup::Found(blob));
                    }
                    let flight = Flight::default();
                    flights.insert(key, Arc::clone(&flight));
                    flight
                }
            }
        };
        let outcome = flight
            .get_or_init(|| {
                let _guard = LoadGuard::enter(marker);
                let outcome = load();
                self.record_load(key, &outcome);
                outcome
            })
            .clone();
        let mut flights = self.inner.in_flight.lock();
        if flights.get(&key).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
            flights.remove(&key);
        }
        outcome
    }

    /// Cache `blob` under `key`, replacing any previous entry.
    pub fn insert(&self, key: CacheKey, blob: Blob) {
        let weight = (self.inner.weigher)(&key.key, &blob);
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let slot = Slot {
            blob,
            weight,
            last_access: now,
        };
        if let Some(old) = state.lru.put(key, slot) {
            state.total_weight -= old.weight;
        }
        state.total_weight += weight;
        self.enforce_limits(&mut state, now);
    }

    /// Drop `key` from the cache.
    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.state.lock().remove(key);
    }

    /// Drop every entry.
    pub fn invalidate_all(&self) {
        let mut state = self.inner.state.lock();
        state.lru.clear();
        state.total_weight = 0;
    }

    /// Number of cached blobs, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.inner.state.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let (entries, weight) = {
            let state = self.inner.state.lock();
            (state.lru.len(), state.total_weight)
        };
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            load_failures: c.load_failures.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            entries,
            weight,
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn lookup(&self, key: &CacheKey) -> Option<Blob> {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        match state.lru.get_mut(key) {
            Some(slot) if !self.is_expired(slot, now) => {
                slot.last_access = now;
                return Some(slot.blob.clone());
            }
            Some(_) => {}
            None => return None,
        }
        state.remove(key);
        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn record_load(&self, key: CacheKey, outcome: &StoreResult<Lookup>) {
        let c = &self.inner.counters;
        match outcome {
            Ok(Lookup::Found(blob)) => {
                c.loads.fetch_add(1, Ordering::Relaxed);
                self.insert(key, blob.clone());
            }
            Ok(Lookup::NotFound) => {
                c.loads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                c.load_failures.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key.key.short_hex(), error = %e, "cache load failed");
            }
        }
    }

    fn is_expired(&self, slot: &Slot, now: Instant) -> bool {
        self.inner
            .config
            .expire_after_access()
            .is_some_and(|ttl| now.duration_since(slot.last_access) > ttl)
    }

    fn over_limits(&self, state: &CacheState) -> bool {
        let config = &self.inner.config;
        config.max_entries.is_some_and(|max| state.lru.len() > max)
            || config.max_weight.is_some_and(|max| state.total_weight > max)
    }

    fn enforce_limits(&self, state: &mut CacheState, now: Instant) {
        let mut evicted = 0u64;
        while state
            .lru
            .peek_lru()
            .is_some_and(|(_, slot)| self.is_expired(slot, now))
        {
            state.pop_lru();
            evicted += 1;
        }
        while self.over_limits(state) && state.pop_lru().is_some() {
            evicted += 1;
        }
        if evicted > 0 {
            self.inner
                .counters
                .evictions
                .fetch_add(evicted, Ordering::Relaxed);
            debug!(evicted, entries = state.lru.len(), "cache eviction");
        }
    }
}

impl fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCache")
            .field("scoping", &self.scoping())
            .field("stats", &self.stats())
            .finish()
    }
}
