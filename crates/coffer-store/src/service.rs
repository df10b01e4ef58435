//! Name → bucket resolution.
//!
//! A [`BucketService`] hands out buckets by name. Asking for a name the
//! service does not serve is [`StoreError::UnknownBucket`], which is distinct
//! from a backend failure while resolving a served name.

use std::sync::Arc;

use coffer_crypto::HashFunction;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::blob::Materialization;
use crate::cache::{CacheConfig, CacheStats, KeyScoping, SharedCache};
use crate::caching::CachingBucket;
use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryBucket;
use crate::traits::Bucket;

/// A registry resolving bucket names.
pub trait BucketService: Send + Sync {
    /// Resolve `name` to a bucket.
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>>;

    /// Release the resources shared by the service's buckets.
    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl<S: BucketService + ?Sized> BucketService for Arc<S> {
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>> {
        (**self).bucket(name)
    }

    fn close(&self) -> StoreResult<()> {
        (**self).close()
    }
}

fn same_service(a: &Arc<dyn BucketService>, b: &Arc<dyn BucketService>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

/// Decides which names a service accepts.
pub type NamePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One bucket answering under every accepted name.
pub struct SharedNameService {
    bucket: Arc<dyn Bucket>,
    accepts: NamePredicate,
}

impl SharedNameService {
    /// Serve `bucket` under any name.
    pub fn new(bucket: Arc<dyn Bucket>) -> Self {
        Self::with_predicate(bucket, |_| true)
    }

    /// Serve `bucket` under names accepted by `accepts`.
    pub fn with_predicate<P>(bucket: Arc<dyn Bucket>, accepts: P) -> Self
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            bucket,
            accepts: Arc::new(accepts),
        }
    }
}

impl BucketService for SharedNameService {
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>> {
        if (self.accepts)(name) {
            Ok(Arc::clone(&self.bucket))
        } else {
            Err(StoreError::UnknownBucket(name.to_string()))
        }
    }
}

/// One [`MemoryBucket`] per name, created on first request.
pub struct MemoryService {
    buckets: DashMap<String, Arc<MemoryBucket>>,
    function: &'static HashFunction,
    materialization: Materialization,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::with_hash_function(HashFunction::sha256())
    }

    pub fn with_hash_function(function: &'static HashFunction) -> Self {
        Self {
            buckets: DashMap::new(),
            function,
            materialization: Materialization::Heap,
        }
    }

    /// Keep values of every bucket off-heap.
    pub fn direct(mut self) -> Self {
        self.materialization = Materialization::Direct;
        self
    }

    /// Names of the buckets created so far, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for MemoryService {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketService for MemoryService {
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>> {
        if let Some(bucket) = self.buckets.get(name) {
            return Ok(bucket.value().clone());
        }
        let bucket = self
            .buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(
                    MemoryBucket::with_hash_function(self.function)
                        .with_materialization(self.materialization),
                )
            })
            .value()
            .clone();
        Ok(bucket)
    }
}

/// Wraps a resolved bucket. Receives the bucket name and the inner bucket.
pub type Decorator =
    Arc<dyn Fn(&str, Arc<dyn Bucket>) -> StoreResult<Arc<dyn Bucket>> + Send + Sync>;

/// A service whose buckets are wrapped by a per-name decorator.
///
/// The decorated bucket of each name is built once and reused, so decorator
/// state (such as a warm cache) survives repeated lookups. Failures while
/// resolving or decorating propagate unchanged and are not remembered.
pub struct DecoratedService {
    inner: Arc<dyn BucketService>,
    decorator: Decorator,
    decorated: DashMap<String, Arc<dyn Bucket>>,
}

impl DecoratedService {
    pub fn new<D>(inner: Arc<dyn BucketService>, decorator: D) -> Self
    where
        D: Fn(&str, Arc<dyn Bucket>) -> StoreResult<Arc<dyn Bucket>> + Send + Sync + 'static,
    {
        Self {
            inner,
            decorator: Arc::new(decorator),
            decorated: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn BucketService> {
        &self.inner
    }
}

impl BucketService for DecoratedService {
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>> {
        if let Some(bucket) = self.decorated.get(name) {
            return Ok(bucket.value().clone());
        }
        let bucket = (self.decorator)(name, self.inner.bucket(name)?)?;
        // A concurrent first lookup may have won; everyone gets its instance.
        let winner = self
            .decorated
            .entry(name.to_string())
            .or_insert(bucket)
            .value()
            .clone();
        debug!(bucket = name, "decorated bucket");
        Ok(winner)
    }

    fn close(&self) -> StoreResult<()> {
        self.inner.close()
    }
}

/// A service whose buckets share one cache.
pub struct CachingService {
    service: DecoratedService,
    cache: SharedCache,
}

impl CachingService {
    /// Decorate `inner` with buckets attached to `cache`.
    pub fn new(inner: Arc<dyn BucketService>, cache: SharedCache) -> Self {
        let attach_to = cache.clone();
        let service = DecoratedService::new(inner, move |_, bucket| {
            let caching: Arc<dyn Bucket> = Arc::new(CachingBucket::new(bucket, &attach_to)?);
            Ok(caching)
        });
        Self { service, cache }
    }

    /// Decorate `inner` with a fresh cache built from `config`.
    pub fn with_config(inner: Arc<dyn BucketService>, config: CacheConfig) -> StoreResult<Self> {
        Ok(Self::new(inner, SharedCache::new(config)?))
    }

    pub fn inner(&self) -> &Arc<dyn BucketService> {
        self.service.inner()
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl BucketService for CachingService {
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>> {
        self.service.bucket(name)
    }

    fn close(&self) -> StoreResult<()> {
        self.service.close()
    }
}

/// One digest-keyed cache in front of several services.
///
/// Decorating the same service instance twice returns the same
/// [`CachingService`]. Decorated services live as long as this value.
pub struct MultiServiceCache {
    cache: SharedCache,
    services: Mutex<Vec<Arc<CachingService>>>,
}

impl MultiServiceCache {
    /// Create the shared cache. Scoping is always [`KeyScoping::Shared`].
    pub fn new(config: CacheConfig) -> StoreResult<Self> {
        let config = CacheConfig {
            scoping: KeyScoping::Shared,
            ..config
        };
        Ok(Self {
            cache: SharedCache::new(config)?,
            services: Mutex::new(Vec::new()),
        })
    }

    /// Return the caching decoration of `service`, creating it once.
    pub fn decorate(&self, service: Arc<dyn BucketService>) -> Arc<CachingService> {
        let mut services = self.services.lock();
        if let Some(existing) = services.iter().find(|s| same_service(s.inner(), &service)) {
            return Arc::clone(existing);
        }
        let decorated = Arc::new(CachingService::new(service, self.cache.clone()));
        services.push(Arc::clone(&decorated));
        decorated
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Blob;
    use crate::testing;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn same_bucket(a: &Arc<dyn Bucket>, b: &Arc<dyn Bucket>) -> bool {
        crate::traits::same_instance(a, b)
    }

    #[test]
    fn shared_name_service_applies_the_predicate() {
        let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new());
        let service = SharedNameService::with_predicate(bucket.clone(), |name| name.starts_with("ok"));
        assert!(same_bucket(&service.bucket("ok-1").unwrap(), &bucket));
        assert!(same_bucket(&service.bucket("ok-2").unwrap(), &bucket));
        let err = service.bucket("nope").err().unwrap();
        assert!(matches!(err, StoreError::UnknownBucket(name) if name == "nope"));

        let open = SharedNameService::new(bucket.clone());
        assert!(same_bucket(&open.bucket("anything").unwrap(), &bucket));
    }

    #[test]
    fn memory_service_creates_one_bucket_per_name() {
        let service = MemoryService::new();
        let a1 = service.bucket("a").unwrap();
        let a2 = service.bucket("a").unwrap();
        let b = service.bucket("b").unwrap();
        assert!(same_bucket(&a1, &a2));
        assert!(!same_bucket(&a1, &b));
        let key = a1.put(Blob::from_slice(b"in a")).unwrap();
        assert!(!b.contains(&key).unwrap());
        assert_eq!(service.names(), vec!["a".to_string(), "b".to_string()]);
        testing::exercise(service.bucket("c").unwrap().as_ref());
    }

    #[test]
    fn decoration_is_memoized_per_name() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = DecoratedService::new(Arc::new(MemoryService::new()), move |_, bucket| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(bucket)
        });
        let first = service.bucket("x").unwrap();
        let again = service.bucket("x").unwrap();
        service.bucket("y").unwrap();
        assert!(same_bucket(&first, &again));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn decoration_failures_propagate_and_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = DecoratedService::new(Arc::new(MemoryService::new()), move |name, bucket| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StoreError::Configuration(format!("cannot decorate {name}")))
            } else {
                Ok(bucket)
            }
        });
        assert!(matches!(
            service.bucket("z"),
            Err(StoreError::Configuration(_))
        ));
        assert!(service.bucket("z").is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_names_pass_through_decoration() {
        let inner = SharedNameService::with_predicate(Arc::new(MemoryBucket::new()), |n| n == "only");
        let service = DecoratedService::new(Arc::new(inner), |_, bucket| Ok(bucket));
        assert!(matches!(
            service.bucket("other"),
            Err(StoreError::UnknownBucket(_))
        ));
    }

    #[test]
    fn caching_service_reuses_warm_buckets() {
        let service =
            CachingService::with_config(Arc::new(MemoryService::new()), CacheConfig::default())
                .unwrap();
        let bucket = service.bucket("warm").unwrap();
        let key = bucket.put(Blob::from_slice(b"warm content")).unwrap();
        let again = service.bucket("warm").unwrap();
        assert!(same_bucket(&bucket, &again));
        again.get(&key).unwrap().unwrap();
        assert_eq!(service.stats().hits, 1);
        testing::exercise(service.bucket("other").unwrap().as_ref());
    }

    #[test]
    fn multi_service_cache_decorates_each_service_once() {
        let multi = MultiServiceCache::new(CacheConfig::default()).unwrap();
        assert_eq!(multi.cache().scoping(), KeyScoping::Shared);
        let service: Arc<dyn BucketService> = Arc::new(MemoryService::new());
        let first = multi.decorate(service.clone());
        let second = multi.decorate(service);
        assert!(Arc::ptr_eq(&first, &second));
        let other = multi.decorate(Arc::new(MemoryService::new()));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn multi_service_cache_shares_entries_by_digest() {
        let multi = MultiServiceCache::new(CacheConfig::default()).unwrap();
        let left = multi.decorate(Arc::new(MemoryService::new()));
        let right = multi.decorate(Arc::new(MemoryService::new()));
        let key = left
            .bucket("l")
            .unwrap()
            .put(Blob::from_slice(b"digest keyed"))
            .unwrap();
        let blob = right.bucket("r").unwrap().get(&key).unwrap().unwrap();
        assert_eq!(blob.read_all().unwrap(), b"digest keyed");
        assert_eq!(multi.stats().hits, 1);
    }

    #[test]
    fn multi_service_cache_rejects_other_hash_functions() {
        let multi = MultiServiceCache::new(CacheConfig::default()).unwrap();
        let sha = multi.decorate(Arc::new(MemoryService::new()));
        let blake = multi.decorate(Arc::new(MemoryService::with_hash_function(
            HashFunction::blake3(),
        )));
        sha.bucket("s").unwrap();
        assert!(matches!(
            blake.bucket("b"),
            Err(StoreError::Configuration(_))
        ));
    }
}
