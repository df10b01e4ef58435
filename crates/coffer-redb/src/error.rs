use coffer_store::StoreError;

/// Errors raised by the redb engine.
#[derive(Debug, thiserror::Error)]
pub enum RedbError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

/// Result alias for engine-level operations.
pub type RedbResult<T> = Result<T, RedbError>;

impl From<RedbError> for StoreError {
    fn from(e: RedbError) -> Self {
        let context = match &e {
            RedbError::Database(_) => "redb database",
            RedbError::Transaction(_) => "redb transaction",
            RedbError::Table(_) => "redb table",
            RedbError::Storage(_) => "redb storage",
            RedbError::Commit(_) => "redb commit",
        };
        StoreError::backend(context, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn engine_errors_become_backend_failures() {
        let engine = RedbError::from(redb::TableError::TableDoesNotExist("blobs".into()));
        let err = StoreError::from(engine);
        assert!(matches!(err, StoreError::Backend { .. }));
        assert_eq!(err.to_string(), "backend failure: redb table");
        assert!(err.source().unwrap().to_string().contains("blobs"));
    }
}
