//! Embedded, transactional storage for Coffer buckets, built on `redb`.
//!
//! One database file holds any number of buckets, one table per bucket.
//! Every operation runs in its own redb transaction; the write-if-absent
//! check and the insert share one write transaction. Tables are created on
//! first write, and reading a table that does not exist yet reports absence.
//!
//! - [`RedbBucket`] -- a bucket owning its database file
//! - [`RedbService`] -- named buckets sharing one database

mod database;
pub mod bucket;
pub mod error;
pub mod service;

pub use bucket::{RedbBucket, RedbOptions};
pub use error::{RedbError, RedbResult};
pub use service::{is_valid_name, RedbService};
