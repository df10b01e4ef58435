use std::path::Path;
use std::sync::Arc;

use coffer_store::{Bucket, BucketService, StoreError, StoreResult};
use dashmap::DashMap;
use redb::TableHandle;

use crate::bucket::{RedbBucket, RedbOptions};
use crate::database::SharedDatabase;

/// Whether `name` can name a bucket: non-empty, ASCII letters, digits,
/// `_`, `.` and `-` only.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// Named buckets in one database file, one table per name.
///
/// Every bucket uses the hash function and materialization of the options
/// the service was opened with. Closing the service closes the database for
/// all of its buckets.
pub struct RedbService {
    db: Arc<SharedDatabase>,
    options: RedbOptions,
    buckets: DashMap<String, Arc<RedbBucket>>,
}

impl RedbService {
    /// Open or create the database at `path`. `options.table` is ignored.
    pub fn open(path: impl AsRef<Path>, options: RedbOptions) -> StoreResult<Self> {
        let db = SharedDatabase::open(path.as_ref(), options.cache_size)?;
        Ok(Self {
            db: Arc::new(db),
            options,
            buckets: DashMap::new(),
        })
    }

    /// Names of the buckets holding data, sorted.
    pub fn names(&self) -> StoreResult<Vec<String>> {
        let mut names = self.db.with_db(|db| {
            let txn = db.begin_read()?;
            let names: Vec<String> = txn
                .list_tables()?
                .map(|table| table.name().to_string())
                .collect();
            Ok(names)
        })?;
        names.sort();
        Ok(names)
    }
}

impl BucketService for RedbService {
    fn bucket(&self, name: &str) -> StoreResult<Arc<dyn Bucket>> {
        if !is_valid_name(name) {
            return Err(StoreError::UnknownBucket(name.to_string()));
        }
        if self.db.is_closed() {
            return Err(StoreError::Closed);
        }
        let bucket = self
            .buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                let options = self.options.clone().table(name);
                Arc::new(RedbBucket::attached(Arc::clone(&self.db), &options))
            })
            .value()
            .clone();
        Ok(bucket)
    }

    fn close(&self) -> StoreResult<()> {
        self.db.close();
        Ok(())
    }
}
