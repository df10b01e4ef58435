use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::blob::{Blob, BlobEntry, Materialization};
use crate::error::StoreResult;
use crate::skeletal;
use crate::traits::Bucket;

/// In-memory, `DashMap`-backed bucket.
///
/// Intended for tests, seeds and embedding. Write-if-absent is atomic per key
/// through the map's entry API, so no external locking is needed. Values are
/// kept on the heap, or off-heap when created with [`MemoryBucket::direct`].
pub struct MemoryBucket {
    blobs: DashMap<ContentKey, Blob>,
    function: &'static HashFunction,
    materialization: Materialization,
    writes: AtomicU64,
}

impl MemoryBucket {
    /// Create an empty heap-backed bucket keyed by SHA-256.
    pub fn new() -> Self {
        Self::with_hash_function(HashFunction::sha256())
    }

    /// Create an empty bucket keeping values off-heap.
    pub fn direct() -> Self {
        Self::new().with_materialization(Materialization::Direct)
    }

    /// Create an empty heap-backed bucket keyed by `function`.
    pub fn with_hash_function(function: &'static HashFunction) -> Self {
        Self {
            blobs: DashMap::new(),
            function,
            materialization: Materialization::Heap,
            writes: AtomicU64::new(0),
        }
    }

    /// Select where stored values live.
    pub fn with_materialization(mut self, materialization: Materialization) -> Self {
        self.materialization = materialization;
        self
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Returns `true` if the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total payload bytes across all stored blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs
            .iter()
            .map(|entry| entry.value().size().unwrap_or(0))
            .sum()
    }

    /// Number of values physically inserted since creation.
    ///
    /// Re-inserting present content does not count.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Return a sorted list of all keys in the bucket.
    pub fn keys(&self) -> Vec<ContentKey> {
        let mut keys: Vec<ContentKey> = self.blobs.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    /// Remove all blobs from the bucket.
    pub fn clear(&self) {
        self.blobs.clear();
    }

    fn insert(&self, entry: BlobEntry) -> StoreResult<()> {
        if let Entry::Vacant(slot) = self.blobs.entry(entry.key) {
            slot.insert(self.materialization.apply(&entry.blob)?);
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Default for MemoryBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl Bucket for MemoryBucket {
    fn hash_function(&self) -> &'static HashFunction {
        self.function
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.blobs.contains_key(key))
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        let mut found = skeletal::requested(keys);
        found.retain(|key| self.blobs.contains_key(key));
        Ok(found)
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        Ok(self.blobs.get(key).map(|blob| blob.value().clone()))
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        Ok(keys
            .iter()
            .filter_map(|key| self.blobs.get(key).map(|blob| (*key, blob.value().clone())))
            .collect())
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        skeletal::put_one(self.function, blob, |entry| self.insert(entry))
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        skeletal::put_batch(self.function, blobs, |entries| {
            entries.into_iter().try_for_each(|entry| self.insert(entry))
        })
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("hash_function", &self.function)
            .field("blob_count", &self.len())
            .field("materialization", &self.materialization)
            .finish()
    }
}
