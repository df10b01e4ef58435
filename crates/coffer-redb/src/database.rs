use std::path::{Path, PathBuf};

use coffer_store::{StoreError, StoreResult};
use parking_lot::RwLock;
use redb::{Builder, Database};
use tracing::{debug, info};

use crate::error::{RedbError, RedbResult};

enum State {
    Open(Database),
    Closed,
}

/// A database file with an open/closed lifecycle.
///
/// Operations hold the read side of the lock for their whole transaction, so
/// closing waits for in-flight operations and later ones fail fast.
pub(crate) struct SharedDatabase {
    path: PathBuf,
    state: RwLock<State>,
}

impl SharedDatabase {
    /// Open or create the database at `path`. `cache_size` is the page cache
    /// size in bytes.
    pub(crate) fn open(path: &Path, cache_size: Option<usize>) -> StoreResult<Self> {
        let mut builder = Builder::new();
        if let Some(bytes) = cache_size {
            builder.set_cache_size(bytes);
        }
        let db = builder.create(path).map_err(RedbError::from)?;
        info!(path = %path.display(), "opened redb database");
        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(State::Open(db)),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the open database.
    pub(crate) fn with_db<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database) -> RedbResult<T>,
    {
        match &*self.state.read() {
            State::Open(db) => Ok(f(db)?),
            State::Closed => Err(StoreError::Closed),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(&*self.state.read(), State::Closed)
    }

    /// Release the database file. Closing twice is a no-op.
    pub(crate) fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), State::Closed);
        match previous {
            State::Open(db) => {
                drop(db);
                info!(path = %self.path.display(), "closed redb database");
            }
            State::Closed => debug!(path = %self.path.display(), "redb database already closed"),
        }
    }
}
