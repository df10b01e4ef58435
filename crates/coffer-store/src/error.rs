use std::error::Error;
use std::sync::Arc;

use coffer_crypto::CryptoError;

/// Errors from bucket and service operations.
///
/// Absence is never an error: lookups report it through `Option` or an
/// empty collection. The enum is `Clone` so that every caller waiting on one
/// shared cache load receives the same failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A service was asked for a bucket name it does not serve.
    #[error("unknown bucket: {0}")]
    UnknownBucket(String),

    /// The bucket (or service) was closed explicitly.
    #[error("bucket is closed")]
    Closed,

    /// The underlying storage failed; the cause is carried unchanged.
    #[error("backend failure: {context}")]
    Backend {
        context: String,
        #[source]
        source: Arc<dyn Error + Send + Sync>,
    },

    /// Invalid construction of a bucket, decorator or service.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Hash function resolution failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// An archive could not be decomposed.
    #[error("invalid archive: {0}")]
    Archive(String),

    /// A lazy blob produced a different number of bytes than it declared.
    #[error("blob size mismatch: declared {declared} bytes, read {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
}

impl StoreError {
    /// Wrap a backend failure with a short description of the operation.
    pub fn backend<E>(context: impl Into<String>, source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::Backend {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Returns `true` for [`StoreError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::backend("I/O error", e)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
