//! Foundation types for Coffer, a content-addressable blob store.
//!
//! Every other Coffer crate depends on `coffer-types`.
//!
//! # Key Types
//!
//! - [`ContentKey`] -- fixed-length digest identifying a blob's content
//! - [`TypeError`] -- parse failures for keys

pub mod error;
pub mod key;

pub use error::TypeError;
pub use key::ContentKey;
