/// Errors from hash function resolution.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("unknown hash function: {0}")]
    UnknownFunction(String),
}
