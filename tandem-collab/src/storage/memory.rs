//! In-memory [`SnapshotStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tandem_core::DocumentId;

use super::{ChangeFeed, RowChanges, RowFilter, SnapshotStore, StoreError};

#[derive(Default)]
struct Rows {
    blobs: HashMap<DocumentId, Vec<u8>>,
    writes: HashMap<DocumentId, usize>,
}

/// Volatile store, shared between sessions of one process.
pub struct MemoryStore {
    rows: Mutex<Rows>,
    feed: ChangeFeed,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Rows::default()),
            feed: ChangeFeed::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Successful writes of `id` so far.
    pub fn write_count(&self, id: DocumentId) -> usize {
        self.lock().writes.get(&id).copied().unwrap_or(0)
    }

    /// Make every following write fail with [`StoreError::WriteRejected`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn remove(&self, id: DocumentId) -> bool {
        let removed = self.lock().blobs.remove(&id).is_some();
        if removed {
            self.feed.notify(id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore for MemoryStore {
    fn get_snapshot(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().blobs.get(&id).cloned())
    }

    fn put_snapshot(&self, id: DocumentId, blob: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected(id));
        }
        {
            let mut rows = self.lock();
            rows.blobs.insert(id, blob.to_vec());
            *rows.writes.entry(id).or_default() += 1;
        }
        self.feed.notify(id);
        Ok(())
    }

    fn on_row_changed(&self, table: &str, filter: RowFilter) -> RowChanges {
        self.feed.subscribe(table, filter)
    }
}
