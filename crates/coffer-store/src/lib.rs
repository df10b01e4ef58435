//! Content-addressable blob storage for Coffer.
//!
//! Callers store immutable byte payloads and read them back by the digest of
//! their content. Every piece of data is a [`Blob`] identified by a
//! [`ContentKey`](coffer_types::ContentKey) derived from its bytes by the
//! bucket's [`HashFunction`](coffer_crypto::HashFunction).
//!
//! # Blob Representations
//!
//! - Lazy -- a re-openable byte source, buffered only when converted
//! - Loaded -- a shared heap buffer
//! - Direct -- a read-only off-heap memory map
//!
//! # Buckets
//!
//! All stores implement the [`Bucket`] trait:
//!
//! - [`MemoryBucket`] -- `DashMap`-based bucket for tests, seeds and embedding
//! - [`CachingBucket`] -- single-flight front cache over another bucket
//! - [`FallbackBucket`] -- read-through pair (plain or seeded)
//! - [`SyncReplicaBucket`] -- synchronous dual-write pair
//!
//! Services ([`BucketService`]) resolve bucket names and can decorate every
//! resolved bucket, for example with a shared cache.
//!
//! # Design Rules
//!
//! 1. Content is immutable once written; identity is the digest of the bytes.
//! 2. Writes are write-if-absent and idempotent.
//! 3. Absence is a normal outcome, never an error.
//! 4. Every operation is safe under concurrent callers.
//! 5. Backend errors are propagated, never silently ignored or retried.

pub mod archive;
pub mod blob;
pub mod cache;
pub mod caching;
pub mod compose;
pub mod error;
pub mod memory;
pub mod service;
pub mod skeletal;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export primary types at crate root for ergonomic imports.
pub use archive::{format_listing, MaybeCompressed};
pub use blob::{Blob, BlobEntry, BlobKind, ByteSource, FileSource, FnSource, Materialization};
pub use cache::{
    BucketScope, CacheConfig, CacheKey, CacheStats, KeyScoping, Lookup, SharedCache, Weigher,
};
pub use caching::{CachingBucket, CachingBucketBuilder};
pub use compose::{FallbackBucket, SyncReplicaBucket};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryBucket;
pub use service::{
    BucketService, CachingService, DecoratedService, MemoryService, MultiServiceCache,
    SharedNameService,
};
pub use traits::Bucket;
