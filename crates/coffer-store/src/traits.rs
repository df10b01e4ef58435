use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;

use crate::archive::{self, MaybeCompressed};
use crate::blob::Blob;
use crate::error::StoreResult;

/// A content-addressable namespace.
///
/// All implementations must satisfy these invariants:
/// - A blob's key is the digest of its bytes under [`Bucket::hash_function`];
///   the same content always yields the same key.
/// - Writes are write-if-absent: storing content that is already present is a
///   no-op that returns the existing key.
/// - Absence is not an error. `get`, `contains` and the batch variants report
///   missing keys by leaving them out.
/// - Every operation is safe under concurrent callers on one instance.
/// - Backend failures are propagated, never silently ignored or retried.
pub trait Bucket: Send + Sync {
    /// The function deriving keys for this bucket.
    fn hash_function(&self) -> &'static HashFunction;

    /// Whether the bucket holds `key`.
    fn contains(&self, key: &ContentKey) -> StoreResult<bool>;

    /// The subset of `keys` the bucket holds.
    ///
    /// An empty request returns an empty set without touching storage.
    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>>;

    /// Read a blob by key. Returns `Ok(None)` if it does not exist.
    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>>;

    /// Read several blobs. Missing keys are simply absent from the result.
    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>>;

    /// Store a blob and return its key.
    ///
    /// A lazy blob is fully consumed before this returns.
    fn put(&self, blob: Blob) -> StoreResult<ContentKey>;

    /// Store several blobs, returning their keys in input order.
    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>>;

    /// Decompose a zip archive and store each file entry as an independent
    /// blob. Returns entry name → key.
    fn put_archive(&self, archive: &[u8]) -> StoreResult<BTreeMap<String, ContentKey>> {
        archive::put_archive(self, archive)
    }

    /// Like [`Bucket::put_archive`], but each entry is gzipped when that makes
    /// it smaller; the result reports which entries were stored compressed.
    fn put_archive_gzip(
        &self,
        archive: &[u8],
    ) -> StoreResult<BTreeMap<String, MaybeCompressed<ContentKey>>> {
        archive::put_archive_gzip(self, archive)
    }

    /// Release the resources of a resource-owning backend.
    ///
    /// After a close every other operation fails with
    /// [`StoreError::Closed`](crate::StoreError::Closed). Closing twice is a
    /// no-op, as is closing a bucket that owns nothing.
    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl<B: Bucket + ?Sized> Bucket for Arc<B> {
    fn hash_function(&self) -> &'static HashFunction {
        (**self).hash_function()
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        (**self).contains(key)
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        (**self).contained_subset(keys)
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        (**self).get(key)
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        (**self).get_many(keys)
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        (**self).put(blob)
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        (**self).put_many(blobs)
    }

    fn put_archive(&self, archive: &[u8]) -> StoreResult<BTreeMap<String, ContentKey>> {
        (**self).put_archive(archive)
    }

    fn put_archive_gzip(
        &self,
        archive: &[u8],
    ) -> StoreResult<BTreeMap<String, MaybeCompressed<ContentKey>>> {
        (**self).put_archive_gzip(archive)
    }

    fn close(&self) -> StoreResult<()> {
        (**self).close()
    }
}

/// Whether two bucket handles point at the same instance.
pub fn same_instance(a: &Arc<dyn Bucket>, b: &Arc<dyn Bucket>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}
