//! Test tooling shared by every backend and decorator.
//!
//! Available to this crate's tests and, through the `testing` feature, to
//! downstream crates. Helpers panic on contract violations.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use coffer_crypto::HashFunction;
use coffer_types::ContentKey;
use rand::RngCore;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::blob::Blob;
use crate::error::StoreResult;
use crate::traits::Bucket;

/// `len` random bytes.
pub fn random_payload(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Build a zip archive in memory. Names ending in `/` become directories.
pub fn zip_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in files {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("add directory");
        } else {
            writer.start_file(*name, options).expect("start file");
            writer.write_all(data).expect("write entry");
        }
    }
    writer.finish().expect("finish archive").into_inner()
}

/// Run the bucket contract checks against an open bucket.
pub fn exercise(bucket: &dyn Bucket) {
    let function = bucket.hash_function();

    let absent = function.digest_bytes(&random_payload(64));
    assert!(!bucket.contains(&absent).expect("contains"));
    assert!(bucket.get(&absent).expect("get").is_none());
    assert!(bucket.get_many(&[absent]).expect("get_many").is_empty());
    assert!(bucket.contained_subset(&[absent]).expect("subset").is_empty());
    assert!(bucket.contained_subset(&[]).expect("empty subset").is_empty());

    let payload = random_payload(5000);
    let key = bucket.put(Blob::from_slice(&payload)).expect("put");
    assert_eq!(key, function.digest_bytes(&payload));
    assert!(bucket.contains(&key).expect("contains"));
    let stored = bucket.get(&key).expect("get").expect("stored blob");
    assert_eq!(stored.read_all().expect("read"), payload);

    let direct = Blob::direct(&payload).expect("direct blob");
    assert_eq!(bucket.put(direct).expect("put direct"), key);
    let lazy = Blob::lazy(Arc::new(payload.clone()), None);
    assert_eq!(bucket.put(lazy).expect("put lazy"), key);

    let a = random_payload(100);
    let b = random_payload(200);
    let keys = bucket
        .put_many(vec![
            Blob::from_slice(&a),
            Blob::from_slice(&b),
            Blob::from_slice(&a),
        ])
        .expect("put_many");
    assert_eq!(keys.len(), 3);
    assert_eq!(keys[0], function.digest_bytes(&a));
    assert_eq!(keys[1], function.digest_bytes(&b));
    assert_eq!(keys[0], keys[2]);

    let subset = bucket
        .contained_subset(&[keys[0], keys[1], absent, keys[0]])
        .expect("subset");
    assert_eq!(subset, HashSet::from([keys[0], keys[1]]));

    let fetched = bucket
        .get_many(&[keys[0], keys[1], absent])
        .expect("get_many");
    assert_eq!(fetched.len(), 2);
    assert_eq!(fetched[&keys[0]].read_all().expect("read"), a);
    assert_eq!(fetched[&keys[1]].read_all().expect("read"), b);

    let archive = zip_archive(&[
        ("one.txt", random_payload(32).as_slice()),
        ("dir/", b"".as_slice()),
        ("dir/two.txt", random_payload(48).as_slice()),
        ("three.bin", random_payload(16).as_slice()),
    ]);
    let listing = bucket.put_archive(&archive).expect("put_archive");
    assert_eq!(listing.len(), 3);
    let listed: Vec<ContentKey> = listing.values().copied().collect();
    assert_eq!(
        bucket.contained_subset(&listed).expect("subset").len(),
        3
    );
}

/// Put the same fresh payload from `callers` threads at once.
///
/// Asserts every caller received the same key and returns it.
pub fn concurrent_put(bucket: Arc<dyn Bucket>, callers: usize, payload: Vec<u8>) -> ContentKey {
    let payload = Arc::new(payload);
    let barrier = Arc::new(Barrier::new(callers));
    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let bucket = Arc::clone(&bucket);
            let payload = Arc::clone(&payload);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                bucket.put(Blob::from_slice(&payload)).expect("concurrent put")
            })
        })
        .collect();
    let keys: Vec<ContentKey> = handles
        .into_iter()
        .map(|h| h.join().expect("put thread"))
        .collect();
    assert!(keys.windows(2).all(|w| w[0] == w[1]));
    keys[0]
}

/// Call counts recorded by a [`CountingBucket`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub contains: usize,
    pub contained_subset: usize,
    pub get: usize,
    pub get_many: usize,
    pub put: usize,
    pub put_many: usize,
    pub blobs_written: usize,
    pub close: usize,
}

#[derive(Default)]
struct Counters {
    contains: AtomicUsize,
    contained_subset: AtomicUsize,
    get: AtomicUsize,
    get_many: AtomicUsize,
    put: AtomicUsize,
    put_many: AtomicUsize,
    blobs_written: AtomicUsize,
    close: AtomicUsize,
}

/// A bucket wrapper counting the calls that reach the inner bucket.
pub struct CountingBucket<B> {
    inner: B,
    counters: Counters,
    read_delay: Option<Duration>,
}

impl<B: Bucket> CountingBucket<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            counters: Counters::default(),
            read_delay: None,
        }
    }

    /// Sleep before every single-key read, widening race windows.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn counts(&self) -> CallCounts {
        let c = &self.counters;
        CallCounts {
            contains: c.contains.load(Ordering::SeqCst),
            contained_subset: c.contained_subset.load(Ordering::SeqCst),
            get: c.get.load(Ordering::SeqCst),
            get_many: c.get_many.load(Ordering::SeqCst),
            put: c.put.load(Ordering::SeqCst),
            put_many: c.put_many.load(Ordering::SeqCst),
            blobs_written: c.blobs_written.load(Ordering::SeqCst),
            close: c.close.load(Ordering::SeqCst),
        }
    }

    /// Total calls that touched storage for reading.
    pub fn reads(&self) -> usize {
        let c = self.counts();
        c.contains + c.contained_subset + c.get + c.get_many
    }

    /// Total calls that wrote.
    pub fn writes(&self) -> usize {
        let c = self.counts();
        c.put + c.put_many
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

impl<B: Bucket> Bucket for CountingBucket<B> {
    fn hash_function(&self) -> &'static HashFunction {
        self.inner.hash_function()
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        bump(&self.counters.contains);
        self.inner.contains(key)
    }

    fn contained_subset(&self, keys: &[ContentKey]) -> StoreResult<HashSet<ContentKey>> {
        bump(&self.counters.contained_subset);
        self.inner.contained_subset(keys)
    }

    fn get(&self, key: &ContentKey) -> StoreResult<Option<Blob>> {
        bump(&self.counters.get);
        if let Some(delay) = self.read_delay {
            thread::sleep(delay);
        }
        self.inner.get(key)
    }

    fn get_many(&self, keys: &[ContentKey]) -> StoreResult<HashMap<ContentKey, Blob>> {
        bump(&self.counters.get_many);
        self.inner.get_many(keys)
    }

    fn put(&self, blob: Blob) -> StoreResult<ContentKey> {
        bump(&self.counters.put);
        self.counters.blobs_written.fetch_add(1, Ordering::SeqCst);
        self.inner.put(blob)
    }

    fn put_many(&self, blobs: Vec<Blob>) -> StoreResult<Vec<ContentKey>> {
        bump(&self.counters.put_many);
        self.counters
            .blobs_written
            .fetch_add(blobs.len(), Ordering::SeqCst);
        self.inner.put_many(blobs)
    }

    fn close(&self) -> StoreResult<()> {
        bump(&self.counters.close);
        self.inner.close()
    }
}
