use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use coffer_crypto::HashFunction;
use coffer_store::{skeletal, Blob, BlobEntry, Bucket, Materialization, StoreError, StoreResult};
use coffer_types::key::KEY_LEN;
use coffer_types::ContentKey;
use redb::{
    ReadOnlyTable, ReadTransaction, ReadableTable, ReadableTableMetadata, TableDefinition,
    TableError,
};
use tracing::debug;

use crate::database::SharedDatabase;
use crate::error::RedbResult;
use crate::service::is_valid_name;

type BlobTable<'a> = TableDefinition<'a, &'static [u8; KEY_LEN], &'static [u8]>;
type ReadTable = ReadOnlyTable<&'static [u8; KEY_LEN], &'static [u8]>;

/// Options for [`RedbBucket::open`].
#[derive(Clone, Debug)]
pub struct RedbOptions {
    /// Materialize values read from disk off-heap.
    pub direct: bool,
    /// Page cache size in bytes; `None` keeps redb's default.
    pub cache_size: Option<usize>,
    /// Function deriving keys.
    pub hash_function: &'static HashFunction,
    /// Table holding the bucket's blobs.
    pub table: String,
}

impl Default for RedbOptions {
    fn default() -> Self {
        Self {
            direct: false,
            cache_size: None,
            hash_function: HashFunction::sha256(),
            table: "blobs".to_string(),
        }
    }
}

impl RedbOptions {
    pub fn direct(mut self, direct: bool) -> Self {
        self.direct = direct;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = Some(bytes);
        self
    }

    pub fn hash_function(mut self, function: &'static HashFunction) -> Self {
        self.hash_function = function;
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub(crate) fn materialization(&self) -> Materialization {
        if self.direct {
            Materialization::Direct
        } else {
            Materialization::Heap
        }
    }
}

/// A bucket stored in one redb table.
///
/// A bucket opened with [`RedbBucket::open`] owns its database file and
/// releases it on [`Bucket::close`]. Buckets handed out by a
/// [`RedbService`](crate::RedbService) share the service's database and are
/// closed with it.
pub struct RedbBucket {
    db: Arc<SharedDatabase>,
    table: String,
    function: &'static HashFunction,
    materialization: Materialization,
    owns_database: bool,
    writes: AtomicU64,
}

impl RedbBucket {
    /// Open or create the database at `path` and use `options.table` in it.
    pub fn open(path: impl AsRef<Path>, options: RedbOptions) -> StoreResult<Self> {
        if !is_valid_name(&options.table) {
            return Err(StoreError::Configuration(format!(
                "invalid table name: {:?}",
                options.table
            )));
        }
        let db = Arc::new(SharedDatabase::open(path.as_ref(), options.cache_size)?);
        let mut bucket = Self::attached(db, &options);
        bucket.owns_database = true;
        Ok(bucket)
    }

    pub(crate) fn attached(db: Arc<SharedDatabase>, options: &RedbOptions) -> Self {
        Self {
            db,
            table: options.table.clone(),
            function: options.hash_function,
            materialization: options.materialization(),
            owns_database: false,
            writes: AtomicU64::new(0),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn path(&self) -> &Path {
        self.db.path()
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_closed()
    }

    /// Number of values this instance physically inserted.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of blobs in the table.
    pub fn len(&self) -> StoreResult<u64> {
        self.db.with_db(|db| {
            let txn = db.begin_read()?;
            match open_read(&txn, self.definition())? {
                Some(table) => Ok(table.len()?),
                None => Ok(0),
            }
        })
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    fn definition(&self) -> BlobTable<'_> {
        TableDefinition::new(&self.table)
    }

    fn to_blob(&self, bytes: Vec<u8>) -> StoreResult<Blob> {
        match self.materialization {
            Materialization::Heap => Ok(Blob::from_vec(bytes)),
            Materialization::Direct => Blob::direct(&bytes),
        }
    }

    fn write_entries(&self, entries: Vec<BlobEntry>) -> StoreResult<()> {
        let payloads = entries
            .iter()
            .map(|e| Ok((e.key, payload(&e.blob)?)))
            .collect::<StoreResult<Vec<(ContentKey, Cow<'_, [u8]>)>>>()?;
        let written = self.db.with_db(|db| {
            let txn = db.begin_write()?;
            let mut written = 0u64;
            {
                let mut table = txn.open_table(self.definition())?;
                for (key, bytes) in &payloads {
                    if table.get(key.as_bytes())?.is_none() {
                        table.insert(key.as_bytes(), &bytes[..])?;
                        written += 1;
                    }
                }
            }
            txn.commit()?;
            Ok(written)
        })?;
        if written > 0 {
            self.writes.fetch_add(written, Ordering::Relaxed);
            debug!(table = %self.table, written, "redb write");
        }
        Ok(())
    }
}

fn open_read(txn: &ReadTransaction, definition: BlobTable<'_>) -> RedbResult<Option<ReadTable>> {
    match txn.open_table(definition) {
        Ok(table) => Ok(Some(table)),
        Err(TableError::TableDoesNotExist(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn payload(blob: &Blob) -> StoreResult<Cow<'_, [u8]>> {
    match blob.as_bytes() {
        Some(bytes) => Ok(Cow::Borrowed(bytes)),
        None => Ok(Cow::Owned(blob.read_all()?)),
    }
}

impl Bucket for RedbBucket {
    fn hash_function(&self) -> &'static HashFunction {
        self.function
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        self.db.with_db(|db| {
            let txn = db.begin_read()?;
            match open_read(&txn, self.definition())? {
                Some(table) => Ok(table.get(key.as_bytes())?.is_some()),
                None => Ok(false),
            }
        })
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let requested = skeletal::requested(keys);
        self.db.with_db(|db| {
            let txn = db.begin_read()?;
            let Some(table) = open_read(&txn, self.definition())? else {
                return Ok(HashSet::new());
            };
            let mut found = HashSet::with_capacity(requested.len());
            for key in requested {
                if table.get(key.as_bytes())?.is_some() {
                    found.insert(key);
                }
            }
            Ok(found)
        })
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        let bytes = self.db.with_db(|db| {
            let txn = db.begin_read()?;
            match open_read(&txn, self.definition())? {
                Some(table) => Ok(table.get(key.as_bytes())?.map(|v| v.value().to_vec())),
                None => Ok(None),
            }
        })?;
        bytes.map(|b| self.to_blob(b)).transpose()
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let requested = skeletal::requested(keys);
        let found = self.db.with_db(|db| {
            let txn = db.begin_read()?;
            let mut found = Vec::with_capacity(requested.len());
            if let Some(table) = open_read(&txn, self.definition())? {
                for key in requested {
                    if let Some(value) = table.get(key.as_bytes())? {
                        found.push((key, value.value().to_vec()));
                    }
                }
            }
            Ok(found)
        })?;
        found
            .into_iter()
            .map(|(key, bytes)| Ok((key, self.to_blob(bytes)?)))
            .collect()
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        skeletal::put_one(self.function, blob, |entry| self.write_entries(vec![entry]))
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        skeletal::put_batch(self.function, blobs, |entries| self.write_entries(entries))
    }

    fn close(&self) -> StoreResult<()> {
        if self.owns_database {
            self.db.close();
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedbBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBucket")
            .field("path", &self.path())
            .field("table", &self.table)
            .field("hash_function", &self.function)
            .field("materialization", &self.materialization)
            .field("closed", &self.is_closed())
            .finish()
    }
}
