//! Copy-on-write metadata cells.
//!
//! Every table and tablet record lives in a [`CowCell`]: a "clean" immutable
//! snapshot readable without blocking, plus a "dirty" staging copy visible
//! only to the single current writer. Readers clone the clean `Arc` and never
//! synchronize with writers; a writer mutates its private dirty copy and
//! publishes it atomically on commit. Dropping an uncommitted write guard
//! discards the dirty copy.
//!
//! Write exclusivity uses a tokio mutex because write guards are held across
//! system-table writes.

use std::sync::{Arc, RwLock};

use tokio::sync::OwnedMutexGuard;

struct CellInner<T> {
    clean: RwLock<Arc<T>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

/// A copy-on-write cell. Cheap to share: clones reference the same cell.
pub struct CowCell<T: Clone> {
    inner: Arc<CellInner<T>>,
}

impl<T: Clone> Clone for CowCell<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone> CowCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(CellInner {
                clean: RwLock::new(Arc::new(value)),
                writer: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Create a cell already locked for write, as freshly created entities
    /// are staged under a write lock before their first commit.
    pub fn new_locked(value: T) -> (Self, CowWriteGuard<T>) {
        let cell = Self::new(value.clone());
        let permit = cell
            .inner
            .writer
            .clone()
            .try_lock_owned()
            .expect("fresh cell cannot be contended");
        let snapshot = cell.inner.clean.read().unwrap().clone();
        let guard = CowWriteGuard {
            inner: Arc::clone(&cell.inner),
            _permit: permit,
            snapshot,
            dirty: value,
        };
        (cell, guard)
    }

    /// Return the last committed snapshot. Never blocks on writers.
    pub fn read(&self) -> CowReadGuard<T> {
        CowReadGuard {
            snapshot: self.inner.clean.read().unwrap().clone(),
        }
    }

    /// Acquire the exclusive write lock and stage a dirty copy of the
    /// current clean snapshot.
    pub async fn write(&self) -> CowWriteGuard<T> {
        let permit = self.inner.writer.clone().lock_owned().await;
        let snapshot = self.inner.clean.read().unwrap().clone();
        let dirty = (*snapshot).clone();
        CowWriteGuard {
            inner: Arc::clone(&self.inner),
            _permit: permit,
            snapshot,
            dirty,
        }
    }
}

/// Shared handle to a committed snapshot.
pub struct CowReadGuard<T> {
    snapshot: Arc<T>,
}

impl<T> std::ops::Deref for CowReadGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.snapshot
    }
}

/// Exclusive handle to a cell's dirty copy. `data()` still reads the clean
/// snapshot taken at acquisition; `mutable()` exposes the staging copy.
pub struct CowWriteGuard<T: Clone> {
    inner: Arc<CellInner<T>>,
    _permit: OwnedMutexGuard<()>,
    snapshot: Arc<T>,
    dirty: T,
}

impl<T: Clone> CowWriteGuard<T> {
    /// The clean snapshot as of lock acquisition.
    pub fn data(&self) -> &T {
        &self.snapshot
    }

    pub fn dirty(&self) -> &T {
        &self.dirty
    }

    pub fn mutable(&mut self) -> &mut T {
        &mut self.dirty
    }

    /// Atomically publish the dirty copy as the new clean snapshot and
    /// release the write lock.
    pub fn commit(self) {
        let CowWriteGuard { inner, _permit, dirty, .. } = self;
        *inner.clean.write().unwrap() = Arc::new(dirty);
        // _permit drops here, releasing the writer lock.
    }

    /// Discard the dirty copy. Equivalent to dropping the guard; exists so
    /// abort sites read as aborts.
    pub fn abort(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_publishes_dirty_as_clean() {
        let cell = CowCell::new(1u32);
        let mut w = cell.write().await;
        *w.mutable() = 2;
        assert_eq!(*cell.read(), 1, "clean must not change before commit");
        assert_eq!(*w.data(), 1);
        w.commit();
        assert_eq!(*cell.read(), 2);
    }

    #[tokio::test]
    async fn abort_discards_dirty() {
        let cell = CowCell::new(7u32);
        let mut w = cell.write().await;
        *w.mutable() = 8;
        w.abort();
        assert_eq!(*cell.read(), 7);
        // The writer lock must be free again.
        let w2 = cell.write().await;
        assert_eq!(*w2.dirty(), 7);
    }

    #[tokio::test]
    async fn reader_keeps_consistent_snapshot_across_commit() {
        let cell = CowCell::new(10u32);
        let r = cell.read();
        let mut w = cell.write().await;
        *w.mutable() = 11;
        w.commit();
        assert_eq!(*r, 10, "an in-flight reader observes the snapshot it took");
        assert_eq!(*cell.read(), 11);
    }

    #[tokio::test]
    async fn new_locked_starts_with_dirty_staged() {
        let (cell, mut w) = CowCell::new_locked(5u32);
        *w.mutable() = 6;
        w.commit();
        assert_eq!(*cell.read(), 6);
    }
}
