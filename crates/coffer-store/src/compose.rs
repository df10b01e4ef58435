//! Decorators combining two buckets.
//!
//! - [`FallbackBucket`] reads through a primary into a read-only secondary.
//!   The seeded variant additionally owns its primary.
//! - [`SyncReplicaBucket`] writes to a replica and a primary before
//!   returning and reads from the primary alone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;
use tracing::debug;

use crate::blob::Blob;
use crate::error::{StoreError, StoreResult};
use crate::skeletal;
use crate::traits::{same_instance, Bucket};

fn check_pair(first: &Arc<dyn Bucket>, second: &Arc<dyn Bucket>, what: &str) -> StoreResult<()> {
    if same_instance(first, second) {
        return Err(StoreError::Configuration(format!(
            "{what} must be two different buckets"
        )));
    }
    let (a, b) = (first.hash_function(), second.hash_function());
    if a != b {
        return Err(StoreError::Configuration(format!(
            "{what} use different hash functions ({a} and {b})"
        )));
    }
    Ok(())
}

/// Read-through pair: the primary answers first, the secondary fills gaps.
///
/// Writes go only to the primary; the secondary is never mutated.
pub struct FallbackBucket {
    primary: Arc<dyn Bucket>,
    secondary: Arc<dyn Bucket>,
    owns_primary: bool,
}

impl FallbackBucket {
    /// Plain fallback. Closing it closes neither bucket.
    pub fn fallback(primary: Arc<dyn Bucket>, secondary: Arc<dyn Bucket>) -> StoreResult<Self> {
        check_pair(&primary, &secondary, "primary and fallback")?;
        Ok(Self {
            primary,
            secondary,
            owns_primary: false,
        })
    }

    /// Primary seeded from a shared read-only bucket. Closing it closes the
    /// primary and leaves the seed open for its other users.
    pub fn seeded(primary: Arc<dyn Bucket>, seed: Arc<dyn Bucket>) -> StoreResult<Self> {
        check_pair(&primary, &seed, "primary and seed")?;
        Ok(Self {
            primary,
            secondary: seed,
            owns_primary: true,
        })
    }

    pub fn primary(&self) -> &Arc<dyn Bucket> {
        &self.primary
    }

    pub fn secondary(&self) -> &Arc<dyn Bucket> {
        &self.secondary
    }

    pub fn is_seeded(&self) -> bool {
        self.owns_primary
    }
}

impl Bucket for FallbackBucket {
    fn hash_function(&self) -> &'static HashFunction {
        self.primary.hash_function()
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.primary.contains(key)? || self.secondary.contains(key)?)
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let mut found = self.primary.contained_subset(keys)?;
        let rest: Vec<ContentKey> = skeletal::requested(keys)
            .into_iter()
            .filter(|key| !found.contains(key))
            .collect();
        if !rest.is_empty() {
            found.extend(self.secondary.contained_subset(&rest)?);
        }
        Ok(found)
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        match self.primary.get(key)? {
            Some(blob) => Ok(Some(blob)),
            None => self.secondary.get(key),
        }
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut found = self.primary.get_many(keys)?;
        let rest: Vec<ContentKey> = skeletal::requested(keys)
            .into_iter()
            .filter(|key| !found.contains_key(key))
            .collect();
        if !rest.is_empty() {
            for (key, blob) in self.secondary.get_many(&rest)? {
                found.entry(key).or_insert(blob);
            }
        }
        Ok(found)
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        self.primary.put(blob)
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        self.primary.put_many(blobs)
    }

    fn close(&self) -> StoreResult<()> {
        if self.owns_primary {
            self.primary.close()
        } else {
            Ok(())
        }
    }
}

/// Synchronous dual-write pair.
///
/// Every write lands on the replica, then on the primary, before the call
/// returns. With `check_before_write`, entries the primary already holds are
/// not written again anywhere; the replica is not consulted, so a replica
/// that fell behind the primary stays behind for those entries.
pub struct SyncReplicaBucket {
    primary: Arc<dyn Bucket>,
    replica: Arc<dyn Bucket>,
    check_before_write: bool,
}

impl SyncReplicaBucket {
    pub fn new(primary: Arc<dyn Bucket>, replica: Arc<dyn Bucket>) -> StoreResult<Self> {
        check_pair(&primary, &replica, "primary and replica")?;
        Ok(Self {
            primary,
            replica,
            check_before_write: false,
        })
    }

    /// Skip entries the primary already contains.
    pub fn with_check_before_write(mut self, check: bool) -> Self {
        self.check_before_write = check;
        self
    }

    pub fn primary(&self) -> &Arc<dyn Bucket> {
        &self.primary
    }

    pub fn replica(&self) -> &Arc<dyn Bucket> {
        &self.replica
    }
}

impl Bucket for SyncReplicaBucket {
    fn hash_function(&self) -> &'static HashFunction {
        self.primary.hash_function()
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        self.primary.contains(key)
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        self.primary.contained_subset(keys)
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        self.primary.get(key)
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        self.primary.get_many(keys)
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        let entry = blob.to_entry(self.hash_function())?;
        if self.check_before_write && self.primary.contains(&entry.key)? {
            debug!(key = %entry.key.short_hex(), "primary holds entry; replication skipped");
            return Ok(entry.key);
        }
        self.replica.put(entry.blob.clone())?;
        self.primary.put(entry.blob)?;
        Ok(entry.key)
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        let (keys, mut entries) = skeletal::entries_of(self.hash_function(), blobs)?;
        if self.check_before_write && !entries.is_empty() {
            let distinct: Vec<ContentKey> = entries.iter().map(|e| e.key).collect();
            let present = self.primary.contained_subset(&distinct)?;
            if !present.is_empty() {
                debug!(skipped = present.len(), "primary holds entries; replication skipped");
                entries.retain(|e| !present.contains(&e.key));
            }
        }
        if !entries.is_empty() {
            let blobs: Vec<Blob> = entries.into_iter().map(|e| e.blob).collect();
            self.replica.put_many(blobs.clone())?;
            self.primary.put_many(blobs)?;
        }
        Ok(keys)
    }
}
