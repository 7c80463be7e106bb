//! Snapshot persistence.
//!
//! ```text
//! ┌──────────────────┐ put_snapshot ┌────────────────┐
//! │ autosave         │ ───────────► │ SnapshotStore  │
//! │ reconciler       │ ◄─────────── │ (memory/rocks) │
//! └──────────────────┘  RowChange   └────────────────┘
//! ```
//!
//! Every row is one opaque blob keyed by [`DocumentId`]; writes replace the
//! whole value. Each successful write or delete is announced on the store's
//! change feed.

mod memory;
mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, SnapshotMetadata, StoreConfig};

use log::warn;
use tandem_core::DocumentId;
use thiserror::Error;
use tokio::sync::broadcast;

/// Logical table holding every snapshot row.
pub const DOCUMENTS_TABLE: &str = "documents";

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("column family `{0}` not found")]
    MissingColumnFamily(&'static str),
    #[error("snapshot of {id} could not be decompressed: {reason}")]
    Compression { id: DocumentId, reason: String },
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("write to {0} rejected")]
    WriteRejected(DocumentId),
}

/// Row-level persistence with a change feed.
pub trait SnapshotStore: Send + Sync + 'static {
    /// `Ok(None)` when the row does not exist.
    fn get_snapshot(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the row. Last writer wins.
    fn put_snapshot(&self, id: DocumentId, blob: &[u8]) -> Result<(), StoreError>;

    /// Notifications for rows of `table` matching `filter`.
    fn on_row_changed(&self, table: &str, filter: RowFilter) -> RowChanges;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFilter {
    All,
    Id(DocumentId),
}

impl RowFilter {
    fn matches(&self, id: &DocumentId) -> bool {
        match self {
            RowFilter::All => true,
            RowFilter::Id(wanted) => wanted == id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub table: &'static str,
    pub id: DocumentId,
}

/// Filtered subscription to a store's change feed.
pub struct RowChanges {
    table: String,
    filter: RowFilter,
    rx: broadcast::Receiver<RowChange>,
}

impl RowChanges {
    /// Next matching change, or `None` once the store is gone.
    ///
    /// If the subscriber lagged behind, an id filter reports a change for
    /// its row since one may have been missed.
    pub async fn recv(&mut self) -> Option<RowChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => {
                    if change.table == self.table && self.filter.matches(&change.id) {
                        return Some(change);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Row change feed lagged by {n} notifications");
                    if let RowFilter::Id(id) = self.filter {
                        if self.table == DOCUMENTS_TABLE {
                            return Some(RowChange {
                                table: DOCUMENTS_TABLE,
                                id,
                            });
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Broadcast side of a store's change feed.
pub(crate) struct ChangeFeed {
    tx: broadcast::Sender<RowChange>,
}

impl ChangeFeed {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub(crate) fn notify(&self, id: DocumentId) {
        // No subscribers is fine.
        let _ = self.tx.send(RowChange {
            table: DOCUMENTS_TABLE,
            id,
        });
    }

    pub(crate) fn subscribe(&self, table: &str, filter: RowFilter) -> RowChanges {
        RowChanges {
            table: table.to_string(),
            filter,
            rx: self.tx.subscribe(),
        }
    }
}
