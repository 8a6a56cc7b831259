//! Transactional state container
//!
//! [`TxnStore`] holds the committed image of the persistent state and
//! runs mutations inside serializable transactions. A transaction is a
//! closure over a working copy of the state: returning `Ok` commits the
//! copy atomically, returning `Err` discards every mutation made inside
//! the closure. Callers therefore do not need to check intermediate
//! results inside a transaction; the transaction outcome is the sole
//! checkpoint.
//!
//! The committed image can be checkpointed to a file and restored from
//! one, which is what carries bundles across process restarts.

use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::StoreError;

/// Serializable-transaction store over a cloneable state image
#[derive(Debug)]
pub struct TxnStore<S> {
    inner: Mutex<S>,
}

impl<S: Clone> TxnStore<S> {
    /// Create a store with the given initial committed state
    pub fn new(state: S) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    /// Run a transaction
    ///
    /// The closure receives a working copy. `Ok` commits, `Err` rolls
    /// back. Transactions are serialized; the closure must not block on
    /// anything that waits for another transaction.
    pub fn transact<R, E>(&self, f: impl FnOnce(&mut S) -> Result<R, E>) -> Result<R, E> {
        let mut committed = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut working = committed.clone();
        match f(&mut working) {
            Ok(result) => {
                *committed = working;
                Ok(result)
            }
            Err(err) => Err(err),
        }
    }

    /// Run a read-only closure against the committed state
    pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let committed = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&committed)
    }

    /// Write the committed state to a checkpoint file
    pub fn checkpoint(&self, path: &Path) -> Result<(), StoreError>
    where
        S: Serialize,
    {
        let image = self.read(|state| {
            postcard::to_allocvec(state).map_err(|e| StoreError::Serialization(e.to_string()))
        })?;
        std::fs::write(path, &image)?;
        debug!(path = %path.display(), bytes = image.len(), "Wrote store checkpoint");
        Ok(())
    }

    /// Load a store from a checkpoint file
    pub fn restore(path: &Path) -> Result<Self, StoreError>
    where
        S: DeserializeOwned,
    {
        let image = std::fs::read(path)?;
        let state =
            postcard::from_bytes(&image).map_err(|e| StoreError::Deserialization(e.to_string()))?;
        debug!(path = %path.display(), bytes = image.len(), "Restored store checkpoint");
        Ok(Self::new(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Counters {
        a: u32,
        b: u32,
    }

    #[test]
    fn test_commit_on_ok() {
        let store = TxnStore::new(Counters { a: 0, b: 0 });
        let result: Result<u32, ()> = store.transact(|s| {
            s.a = 7;
            Ok(s.a)
        });
        assert_eq!(result, Ok(7));
        assert_eq!(store.read(|s| s.a), 7);
    }

    #[test]
    fn test_rollback_on_err() {
        let store = TxnStore::new(Counters { a: 1, b: 2 });
        let result: Result<(), &str> = store.transact(|s| {
            s.a = 99;
            s.b = 99;
            Err("boom")
        });
        assert_eq!(result, Err("boom"));
        // Both mutations discarded, not just the last.
        assert_eq!(store.read(|s| s.clone()), Counters { a: 1, b: 2 });
    }

    #[test]
    fn test_checkpoint_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");

        let store = TxnStore::new(Counters { a: 3, b: 4 });
        store.checkpoint(&path).unwrap();

        let restored: TxnStore<Counters> = TxnStore::restore(&path).unwrap();
        assert_eq!(restored.read(|s| s.clone()), Counters { a: 3, b: 4 });
    }
}
