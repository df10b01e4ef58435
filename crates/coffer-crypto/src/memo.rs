//! Memo table mapping payload identity to a previously computed digest.
//!
//! Entries are keyed by the address of a shared payload allocation and hold
//! only a weak reference to it. A lookup hits when the weak reference still
//! points at a live allocation with the same address. Because a `Weak` keeps
//! its allocation reserved, a recorded address cannot be recycled by a
//! different payload while the entry exists.
//!
//! A `Weak<T>` keeps the `Arc` header and `T` itself allocated, so payloads
//! are sized handles owning their bytes elsewhere (`Vec<u8>`, a memory map).
//! Dropping the last strong reference then frees the bytes even while the
//! entry remains. Entries that are dead or expired are swept from the least
//! recently used end on every insert.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use coffer_types::ContentKey;
use lru::LruCache;
use parking_lot::Mutex;

/// Default number of memoized digests.
pub const DEFAULT_MEMO_CAPACITY: usize = 1024;

/// Default time an unused memo entry survives.
pub const DEFAULT_MEMO_TTL: Duration = Duration::from_secs(60);

/// Type-erased weak handle on a memoized payload.
trait LivePayload: Send + Sync {
    fn is_live_at(&self, addr: usize) -> bool;
}

impl<T: Send + Sync> LivePayload for Weak<T> {
    fn is_live_at(&self, addr: usize) -> bool {
        self.strong_count() > 0 && self.as_ptr() as usize == addr
    }
}

struct MemoEntry {
    payload: Box<dyn LivePayload>,
    key: ContentKey,
    last_access: Instant,
}

/// Memo statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Bounded, time-expiring, weakly-referenced digest memo.
pub struct DigestMemo {
    entries: Mutex<LruCache<usize, MemoEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DigestMemo {
    /// Create a memo holding at most `capacity` digests, each expiring `ttl`
    /// after its last access.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the memoized digest of `payload`, computing it with `compute` on
    /// a miss.
    ///
    /// `compute` runs outside the memo lock, so concurrent first-time digests
    /// of the same payload may both compute; they produce the same key.
    pub fn get_or_compute<T, F>(&self, payload: &Arc<T>, compute: F) -> ContentKey
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> ContentKey,
    {
        let addr = Arc::as_ptr(payload) as usize;
        if let Some(key) = self.lookup(addr) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return key;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let key = compute(payload);
        let entry = MemoEntry {
            payload: Box::new(Arc::downgrade(payload)),
            key,
            last_access: Instant::now(),
        };
        let mut entries = self.entries.lock();
        self.sweep(&mut entries, entry.last_access);
        entries.put(addr, entry);
        key
    }

    fn sweep(&self, entries: &mut LruCache<usize, MemoEntry>, now: Instant) {
        while let Some((addr, entry)) = entries.peek_lru() {
            if entry.payload.is_live_at(*addr) && now.duration_since(entry.last_access) <= self.ttl {
                break;
            }
            entries.pop_lru();
        }
    }

    fn lookup(&self, addr: usize) -> Option<ContentKey> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries.get_mut(&addr)?;
        if !entry.payload.is_live_at(addr) || now.duration_since(entry.last_access) > self.ttl {
            entries.pop(&addr);
            return None;
        }
        entry.last_access = now;
        Some(entry.key)
    }

    /// Current statistics.
    pub fn stats(&self) -> MemoStats {
        MemoStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }

    /// Drop every memoized digest.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for DigestMemo {
    fn default() -> Self {
        Self::new(DEFAULT_MEMO_CAPACITY, DEFAULT_MEMO_TTL)
    }
}

impl std::fmt::Debug for DigestMemo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestMemo")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn key_of(byte: u8) -> ContentKey {
        ContentKey::from_digest([byte; 32])
    }

    #[test]
    fn same_payload_is_computed_once() {
        let memo = DigestMemo::default();
        let payload = Arc::new(b"payload".to_vec());
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let key = memo.get_or_compute(&payload, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                key_of(1)
            });
            assert_eq!(key, key_of(1));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = memo.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn clones_share_identity() {
        let memo = DigestMemo::default();
        let payload = Arc::new(b"shared".to_vec());
        memo.get_or_compute(&payload, |_| key_of(2));
        let clone = Arc::clone(&payload);
        let key = memo.get_or_compute(&clone, |_| panic!("clone should hit the memo"));
        assert_eq!(key, key_of(2));
    }

    #[test]
    fn equal_bytes_in_distinct_buffers_are_separate_entries() {
        let memo = DigestMemo::default();
        let a = Arc::new(b"same".to_vec());
        let b = Arc::new(b"same".to_vec());
        memo.get_or_compute(&a, |_| key_of(3));
        let calls = AtomicUsize::new(0);
        memo.get_or_compute(&b, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            key_of(3)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_payload_is_not_reused() {
        let memo = DigestMemo::default();
        {
            let payload = Arc::new(b"short-lived".to_vec());
            memo.get_or_compute(&payload, |_| key_of(4));
        }
        let next = Arc::new(b"another one".to_vec());
        let key = memo.get_or_compute(&next, |_| key_of(5));
        assert_eq!(key, key_of(5));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let memo = DigestMemo::new(8, Duration::from_millis(20));
        let payload = Arc::new(b"expiring".to_vec());
        memo.get_or_compute(&payload, |_| key_of(6));
        std::thread::sleep(Duration::from_millis(60));
        let calls = AtomicUsize::new(0);
        memo.get_or_compute(&payload, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            key_of(6)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let memo = DigestMemo::new(2, DEFAULT_MEMO_TTL);
        let payloads: Vec<Arc<Vec<u8>>> = (0..5u8).map(|i| Arc::new(vec![i; 4])).collect();
        for (i, p) in payloads.iter().enumerate() {
            memo.get_or_compute(p, |_| key_of(i as u8));
        }
        assert_eq!(memo.stats().size, 2);
    }

    struct Tracked {
        bytes: Vec<u8>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn entry_does_not_keep_payload_alive() {
        let memo = DigestMemo::default();
        let dropped = Arc::new(AtomicBool::new(false));
        let payload = Arc::new(Tracked {
            bytes: vec![0xab; 1 << 20],
            dropped: Arc::clone(&dropped),
        });
        memo.get_or_compute(&payload, |p| {
            assert_eq!(p.bytes.len(), 1 << 20);
            key_of(7)
        });
        drop(payload);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(memo.stats().size, 1);
    }

    #[test]
    fn inserts_sweep_stale_entries() {
        let memo = DigestMemo::new(8, Duration::from_millis(20));
        let expiring = Arc::new(b"expiring".to_vec());
        memo.get_or_compute(&expiring, |_| key_of(8));
        {
            let dead = Arc::new(b"dead".to_vec());
            memo.get_or_compute(&dead, |_| key_of(9));
        }
        std::thread::sleep(Duration::from_millis(60));
        let fresh = Arc::new(b"fresh".to_vec());
        memo.get_or_compute(&fresh, |_| key_of(10));
        assert_eq!(memo.stats().size, 1);
    }
}
