//! Hash functions for Coffer.
//!
//! A [`HashFunction`] turns payload bytes into a [`ContentKey`]. Functions are
//! process-wide singletons resolved by name through a small registry, so two
//! stores agree on identity exactly when they hold the same function.
//!
//! Digests of materialized payloads are memoized by payload identity in a
//! bounded, expiring, weakly-referenced [`DigestMemo`], so a buffer that is
//! hashed by several layers (a cache, then its backend) is only hashed once.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.
//!
//! [`ContentKey`]: coffer_types::ContentKey

pub mod error;
pub mod hasher;
pub mod memo;

pub use error::CryptoError;
pub use hasher::{Algorithm, Digester, HashFunction};
pub use memo::{DigestMemo, MemoStats};
