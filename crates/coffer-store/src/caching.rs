use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;

use crate::blob::{Blob, Materialization};
use crate::cache::{BucketScope, CacheConfig, CacheKey, CacheStats, Lookup, SharedCache};
use crate::error::StoreResult;
use crate::skeletal;
use crate::traits::Bucket;

/// A bucket fronted by a [`SharedCache`].
///
/// Reads are served from the cache when possible; a miss loads from the
/// backend once, however many callers race on it. Writes always reach the
/// cache and reach the backend unless the content is already cached and
/// `always_write` is off. The decorator owns nothing, so `close` is a no-op.
pub struct CachingBucket {
    backend: Arc<dyn Bucket>,
    cache: SharedCache,
    scope: Option<BucketScope>,
    materialization: Materialization,
    always_write: bool,
}

impl CachingBucket {
    /// Attach `backend` to `cache` using the cache's configuration.
    pub fn new(backend: Arc<dyn Bucket>, cache: &SharedCache) -> StoreResult<Self> {
        Self::builder(backend).cache(cache.clone()).build()
    }

    pub fn builder(backend: Arc<dyn Bucket>) -> CachingBucketBuilder {
        CachingBucketBuilder {
            backend,
            cache: None,
            config: CacheConfig::default(),
            always_write: None,
            direct: None,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Bucket> {
        &self.backend
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// Statistics of the underlying shared cache.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn always_write(&self) -> bool {
        self.always_write
    }

    fn cache_key(&self, key: ContentKey) -> CacheKey {
        CacheKey::new(self.scope, key)
    }

    fn load(&self, key: &ContentKey) -> StoreResult<Lookup> {
        match self.backend.get(key)? {
            Some(blob) => Ok(Lookup::Found(self.materialization.apply(&blob)?)),
            None => Ok(Lookup::NotFound),
        }
    }
}

impl Bucket for CachingBucket {
    fn hash_function(&self) -> &'static HashFunction {
        self.backend.hash_function()
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        if self.cache.is_resident(&self.cache_key(*key)) {
            return Ok(true);
        }
        self.backend.contains(key)
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        let (mut found, rest): (HashSet<ContentKey>, HashSet<ContentKey>) =
            skeletal::requested(keys)
                .into_iter()
                .partition(|key| self.cache.is_resident(&self.cache_key(*key)));
        if !rest.is_empty() {
            let rest: Vec<ContentKey> = rest.into_iter().collect();
            found.extend(self.backend.contained_subset(&rest)?);
        }
        Ok(found)
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        let outcome = self
            .cache
            .get_or_load(self.cache_key(*key), || self.load(key))?;
        Ok(outcome.into_option())
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in skeletal::requested(keys) {
            match self.cache.get_if_present(&self.cache_key(key)) {
                Some(blob) => {
                    found.insert(key, blob);
                }
                None => missing.push(key),
            }
        }
        if !missing.is_empty() {
            for (key, blob) in self.backend.get_many(&missing)? {
                let blob = self.materialization.apply(&blob)?;
                self.cache.insert(self.cache_key(key), blob.clone());
                found.insert(key, blob);
            }
        }
        Ok(found)
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        let entry = blob.to_entry(self.hash_function())?;
        let cache_key = self.cache_key(entry.key);
        if self.always_write || !self.cache.is_resident(&cache_key) {
            self.backend.put(entry.blob.clone())?;
        }
        self.cache
            .insert(cache_key, self.materialization.apply(&entry.blob)?);
        Ok(entry.key)
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        let (keys, entries) = skeletal::entries_of(self.hash_function(), blobs)?;
        let pending: Vec<Blob> = entries
            .iter()
            .filter(|e| self.always_write || !self.cache.is_resident(&self.cache_key(e.key)))
            .map(|e| e.blob.clone())
            .collect();
        if !pending.is_empty() {
            self.backend.put_many(pending)?;
        }
        for entry in entries {
            let blob = self.materialization.apply(&entry.blob)?;
            self.cache.insert(self.cache_key(entry.key), blob);
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for CachingBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingBucket")
            .field("scope", &self.scope)
            .field("materialization", &self.materialization)
            .field("always_write", &self.always_write)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Builder for [`CachingBucket`].
pub struct CachingBucketBuilder {
    backend: Arc<dyn Bucket>,
    cache: Option<SharedCache>,
    config: CacheConfig,
    always_write: Option<bool>,
    direct: Option<bool>,
}

impl CachingBucketBuilder {
    /// Attach to an existing shared cache instead of creating a private one.
    pub fn cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Configuration of the private cache created when no shared cache is
    /// given.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the cache's write-through policy for this bucket.
    pub fn always_write(mut self, always_write: bool) -> Self {
        self.always_write = Some(always_write);
        self
    }

    /// Override where this bucket's cached payloads live.
    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = Some(direct);
        self
    }

    pub fn build(self) -> StoreResult<CachingBucket> {
        let cache = match self.cache {
            Some(cache) => cache,
            None => SharedCache::new(self.config)?,
        };
        let scope = cache.attach(self.backend.hash_function())?;
        let config = cache.config();
        let always_write = self.always_write.unwrap_or(config.always_write());
        let materialization = match self.direct {
            Some(true) => Materialization::Direct,
            Some(false) => Materialization::Heap,
            None => config.materialization(),
        };
        Ok(CachingBucket {
            backend: self.backend,
            cache,
            scope,
            materialization,
            always_write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::KeyScoping;
    use crate::error::StoreError;
    use crate::memory::MemoryBucket;
    use crate::testing::{self, CountingBucket};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn counted() -> Arc<CountingBucket<MemoryBucket>> {
        Arc::new(CountingBucket::new(MemoryBucket::new()))
    }

    fn caching_over(backend: Arc<CountingBucket<MemoryBucket>>) -> CachingBucket {
        CachingBucket::builder(backend).build().unwrap()
    }

    #[test]
    fn passes_the_contract() {
        testing::exercise(&caching_over(counted()));
        let direct = CachingBucket::builder(Arc::new(MemoryBucket::new()))
            .direct(true)
            .build()
            .unwrap();
        testing::exercise(&direct);
        let shared = SharedCache::new(CacheConfig::unbounded(KeyScoping::Shared)).unwrap();
        testing::exercise(&CachingBucket::new(Arc::new(MemoryBucket::new()), &shared).unwrap());
    }

    #[test]
    fn miss_makes_value_resident() {
        let backend = counted();
        let key = backend.inner().put(Blob::from_slice(b"warm me")).unwrap();
        let bucket = caching_over(Arc::clone(&backend));

        let first = bucket.get(&key).unwrap().unwrap();
        assert_eq!(first.read_all().unwrap(), b"warm me");
        assert_eq!(backend.counts().get, 1);

        let second = bucket.get(&key).unwrap().unwrap();
        assert_eq!(second.read_all().unwrap(), b"warm me");
        assert!(bucket.contains(&key).unwrap());
        assert_eq!(backend.counts().get, 1);
        assert_eq!(backend.counts().contains, 0);
        assert_eq!(bucket.stats().loads, 1);
    }

    #[test]
    fn concurrent_misses_hit_the_backend_once() {
        let backend = Arc::new(
            CountingBucket::new(MemoryBucket::new()).with_read_delay(Duration::from_millis(100)),
        );
        let key = backend.inner().put(Blob::from_slice(b"racy")).unwrap();
        let bucket = Arc::new(CachingBucket::builder(backend.clone()).build().unwrap());
        let callers = 24;
        let barrier = Arc::new(Barrier::new(callers));
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    bucket.get(&key).unwrap().unwrap().read_all().unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"racy");
        }
        assert_eq!(backend.counts().get, 1);
    }

    #[test]
    fn missing_keys_are_absent_and_not_cached() {
        let backend = counted();
        let bucket = caching_over(Arc::clone(&backend));
        let key = HashFunction::sha256().digest_bytes(b"nowhere");
        assert!(bucket.get(&key).unwrap().is_none());
        assert!(bucket.get(&key).unwrap().is_none());
        assert_eq!(backend.counts().get, 2);
        assert!(bucket.cache().is_empty());
    }

    #[test]
    fn get_many_batches_the_misses() {
        let backend = counted();
        let bucket = caching_over(Arc::clone(&backend));
        let cached = bucket.put(Blob::from_slice(b"cached")).unwrap();
        let stored = backend.inner().put(Blob::from_slice(b"stored")).unwrap();
        let absent = HashFunction::sha256().digest_bytes(b"absent");

        let found = bucket.get_many(&[cached, stored, absent, stored]).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(backend.counts().get_many, 1);
        assert!(bucket.cache().is_resident(&bucket.cache_key(stored)));
    }

    #[test]
    fn contained_subset_only_asks_for_uncached_keys() {
        let backend = counted();
        let bucket = caching_over(Arc::clone(&backend));
        let cached = bucket.put(Blob::from_slice(b"in cache")).unwrap();
        assert_eq!(bucket.contained_subset(&[cached]).unwrap().len(), 1);
        assert_eq!(backend.counts().contained_subset, 0);

        let stored = backend.inner().put(Blob::from_slice(b"on backend")).unwrap();
        let subset = bucket.contained_subset(&[cached, stored]).unwrap();
        assert_eq!(subset, HashSet::from([cached, stored]));
        assert_eq!(backend.counts().contained_subset, 1);
    }

    #[test]
    fn cached_writes_skip_the_backend_unless_always_write() {
        let backend = counted();
        let bucket = caching_over(Arc::clone(&backend));
        assert!(!bucket.always_write());
        bucket.put(Blob::from_slice(b"once")).unwrap();
        bucket.put(Blob::from_slice(b"once")).unwrap();
        bucket.put_many(vec![Blob::from_slice(b"once")]).unwrap();
        assert_eq!(backend.writes(), 1);

        let backend = counted();
        let bucket = CachingBucket::builder(Arc::clone(&backend) as Arc<dyn Bucket>)
            .always_write(true)
            .build()
            .unwrap();
        bucket.put(Blob::from_slice(b"twice")).unwrap();
        bucket.put(Blob::from_slice(b"twice")).unwrap();
        assert_eq!(backend.writes(), 2);
        assert_eq!(backend.inner().writes(), 1);
    }

    #[test]
    fn direct_cache_holds_off_heap_values() {
        let backend = Arc::new(MemoryBucket::new());
        let bucket = CachingBucket::builder(backend.clone())
            .direct(true)
            .build()
            .unwrap();
        let key = bucket.put(Blob::from_slice(b"mapped")).unwrap();
        assert!(bucket.get(&key).unwrap().unwrap().is_direct());
        assert!(backend.get(&key).unwrap().unwrap().is_loaded());
    }

    #[test]
    fn per_bucket_scoping_isolates_buckets() {
        let cache = SharedCache::new(CacheConfig::default()).unwrap();
        let a = CachingBucket::new(Arc::new(MemoryBucket::new()), &cache).unwrap();
        let b = CachingBucket::new(Arc::new(MemoryBucket::new()), &cache).unwrap();
        let key = a.put(Blob::from_slice(b"private")).unwrap();
        assert!(b.get(&key).unwrap().is_none());
        assert!(!b.contains(&key).unwrap());
    }

    #[test]
    fn shared_scoping_serves_across_buckets() {
        let cache = SharedCache::new(CacheConfig::unbounded(KeyScoping::Shared)).unwrap();
        let a = CachingBucket::new(Arc::new(MemoryBucket::new()), &cache).unwrap();
        let b = CachingBucket::new(Arc::new(MemoryBucket::new()), &cache).unwrap();
        assert!(a.always_write());
        let key = a.put(Blob::from_slice(b"public")).unwrap();
        assert_eq!(b.get(&key).unwrap().unwrap().read_all().unwrap(), b"public");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn shared_scoping_rejects_other_hash_functions() {
        let cache = SharedCache::new(CacheConfig::unbounded(KeyScoping::Shared)).unwrap();
        CachingBucket::new(Arc::new(MemoryBucket::new()), &cache).unwrap();
        let blake = Arc::new(MemoryBucket::with_hash_function(HashFunction::blake3()));
        let err = CachingBucket::new(blake, &cache).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[test]
    fn evicted_entries_are_fetched_again() {
        let backend = counted();
        let first = backend.inner().put(Blob::from_slice(b"first")).unwrap();
        let second = backend.inner().put(Blob::from_slice(b"second")).unwrap();
        let bucket = CachingBucket::builder(backend.clone())
            .config(CacheConfig {
                max_entries: Some(1),
                ..Default::default()
            })
            .build()
            .unwrap();

        assert_eq!(bucket.get(&first).unwrap().unwrap().read_all().unwrap(), b"first");
        assert_eq!(backend.counts().get, 1);
        assert_eq!(bucket.get(&second).unwrap().unwrap().read_all().unwrap(), b"second");
        assert_eq!(bucket.stats().evictions, 1);
        assert!(!bucket.cache().is_resident(&bucket.cache_key(first)));

        let again = bucket.get(&first).unwrap().unwrap();
        assert_eq!(again.read_all().unwrap(), b"first");
        assert_eq!(backend.counts().get, 3);
        assert_eq!(bucket.cache().len(), 1);
    }

    #[test]
    fn stacked_layers_on_one_shared_cache_load_once() {
        let cache = SharedCache::new(CacheConfig::unbounded(KeyScoping::Shared)).unwrap();
        let backend = counted();
        let key = backend.inner().put(Blob::from_slice(b"layered")).unwrap();
        let inner = Arc::new(CachingBucket::new(backend.clone(), &cache).unwrap());
        let outer = CachingBucket::new(inner, &cache).unwrap();

        let blob = outer.get(&key).unwrap().unwrap();
        assert_eq!(blob.read_all().unwrap(), b"layered");
        assert_eq!(backend.counts().get, 1);
        assert_eq!(cache.len(), 1);

        assert!(outer.get(&key).unwrap().is_some());
        assert_eq!(backend.counts().get, 1);
        let absent = HashFunction::sha256().digest_bytes(b"not stored");
        assert!(outer.get(&absent).unwrap().is_none());
    }

    #[test]
    fn backend_failures_propagate() {
        struct Broken;
        impl Bucket for Broken {
            fn hash_function(&self) -> &'static HashFunction {
                HashFunction::sha256()
            }
            fn contains(&self, _: &ContentKey) -> StoreResult<bool> {
                Err(StoreError::Closed)
            }
            fn contained_subset(&self, _: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
                Err(StoreError::Closed)
            }
            fn get(&self, _: &ContentKey) -> StoreResult<Option<Blob>> {
                Err(StoreError::Closed)
            }
            fn get_many(&self, _: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
                Err(StoreError::Closed)
            }
            fn put(&self, _: Blob) -> StoreResult<ContentKey> {
                Err(StoreError::Closed)
            }
            fn put_many(&self, _: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
                Err(StoreError::Closed)
            }
        }

        let bucket = CachingBucket::builder(Arc::new(Broken)).build().unwrap();
        let key = HashFunction::sha256().digest_bytes(b"x");
        assert!(bucket.get(&key).unwrap_err().is_closed());
        assert!(bucket.put(Blob::from_slice(b"x")).unwrap_err().is_closed());
        assert!(!bucket.cache().is_resident(&bucket.cache_key(key)));
        assert_eq!(bucket.stats().load_failures, 1);
    }
}
