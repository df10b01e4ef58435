//! Shared write-path helpers for bucket implementations.
//!
//! A backend supplies raw write-if-absent primitives; these functions derive
//! identity once per blob and collapse duplicates before the raw write runs.
//! Entries reach the raw primitive with their original payload, so a backend
//! re-homing values (e.g. off-heap) does it inside its own write.

use std::collections::HashSet;

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;

use crate::blob::{Blob, BlobEntry};
use crate::error::StoreResult;

/// Normalize a key list into a set, collapsing duplicates.
pub fn requested(keys: &[ContentKey]) -> HashSet<ContentKey> {
    keys.iter().copied().collect()
}

/// Derive the key of `blob` and hand the entry to `raw_put`.
pub fn put_one<F>(function: &HashFunction, blob: Blob, raw_put: F) -> StoreResult<ContentKey>
where
    F: FnOnce(BlobEntry) -> StoreResult<()>,
{
    let entry = blob.to_entry(function)?;
    let key = entry.key;
    raw_put(entry)?;
    Ok(key)
}

/// Derive the keys of `blobs` and hand the distinct entries to
/// `raw_put_many` in one call.
///
/// Returns keys in input order. Only the first occurrence of a key is
/// written. An empty input skips the raw write.
pub fn put_batch<F>(
    function: &HashFunction,
    blobs: Vec<Blob>,
    raw_put_many: F,
) -> StoreResult<Vec<ContentKey>>
where
    F: FnOnce(Vec<BlobEntry>) -> StoreResult<()>,
{
    let (keys, entries) = entries_of(function, blobs)?;
    if !entries.is_empty() {
        raw_put_many(entries)?;
    }
    Ok(keys)
}

/// Derive keys for `blobs`, returning them in input order alongside the
/// distinct entries.
pub fn entries_of(
    function: &HashFunction,
    blobs: Vec<Blob>,
) -> StoreResult<(Vec<ContentKey>, Vec<BlobEntry>)> {
    let mut keys = Vec::with_capacity(blobs.len());
    let mut seen = HashSet::with_capacity(blobs.len());
    let mut entries = Vec::with_capacity(blobs.len());
    for blob in blobs {
        let entry = blob.to_entry(function)?;
        keys.push(entry.key);
        if seen.insert(entry.key) {
            entries.push(entry);
        }
    }
    Ok((keys, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;

    fn sha() -> &'static HashFunction {
        HashFunction::sha256()
    }

    #[test]
    fn requested_collapses_duplicates() {
        let a = sha().digest_bytes(b"a");
        let b = sha().digest_bytes(b"b");
        let set = requested(&[a, b, a, a]);
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a) && set.contains(&b));
    }

    #[test]
    fn put_one_passes_the_key_through() {
        let mut written = None;
        let key = put_one(sha(), Blob::from_slice(b"one"), |entry| {
            written = Some(entry.key);
            Ok(())
        })
        .unwrap();
        assert_eq!(key, sha().digest_bytes(b"one"));
        assert_eq!(written, Some(key));
    }

    #[test]
    fn put_batch_dedupes_and_keeps_order() {
        let blobs = vec![
            Blob::from_slice(b"x"),
            Blob::from_slice(b"y"),
            Blob::from_slice(b"x"),
        ];
        let mut batch = Vec::new();
        let keys = put_batch(sha(), blobs, |entries| {
            batch = entries;
            Ok(())
        })
        .unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], keys[2]);
        assert_ne!(keys[0], keys[1]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key, keys[0]);
        assert_eq!(batch[1].key, keys[1]);
    }

    #[test]
    fn empty_batch_skips_the_write() {
        let called = Cell::new(false);
        let keys = put_batch(sha(), Vec::new(), |_| {
            called.set(true);
            Ok(())
        })
        .unwrap();
        assert!(keys.is_empty());
        assert!(!called.get());
    }

    #[test]
    fn lazy_blobs_arrive_materialized() {
        let lazy = Blob::lazy(Arc::new(b"lazy".to_vec()), None);
        put_one(sha(), lazy, |entry| {
            assert!(entry.blob.is_loaded());
            Ok(())
        })
        .unwrap();
    }
}
