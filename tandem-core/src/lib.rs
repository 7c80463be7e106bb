//! # tandem-core — document and entity model for Tandem
//!
//! Two document shapes live side by side in a Tandem workspace:
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────────┐
//! │ CollabDocument (yrs) │        │ StructuredEntity          │
//! │ token-level merge    │        │ whole-object snapshots    │
//! │ deltas + origin tags │        │ Board, FileTree           │
//! └──────────┬───────────┘        └────────────┬─────────────┘
//!            │ SyncProvider                     │ SnapshotReconciler
//!            ▼                                  ▼
//!      broadcast channel                  persistent store
//! ```
//!
//! ## Modules
//!
//! - [`document`] — mergeable rich-text document on top of yrs
//! - [`entity`] — the contract structured entities implement
//! - [`board`] — task board (columns + tasks)
//! - [`tree`] — hierarchical file tree
//! - [`observer`] — listener sets with drop-to-unsubscribe handles
//! - [`json`] — JSON helpers shared by the document and snapshots

pub mod board;
pub mod document;
pub mod entity;
pub mod json;
pub mod observer;
pub mod tree;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use board::{Assignee, Board, BoardError, BoardMutation, Column, Comment, Task, TaskPatch};
pub use document::{CollabDocument, DocChange, DocumentError, MergeableDocument, OriginTag};
pub use entity::StructuredEntity;
pub use observer::{ListenerSet, Subscription};
pub use tree::{FileNode, FileRow, FileTree, NodeKind, TreeError, TreeMutation};

/// Stable identity of a row in the `documents` table.
///
/// Rich-text documents and structured entities share the same id space;
/// a rich-text document maps 1:1 onto a broadcast channel named
/// [`DocumentId::channel_name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

/// Structured entities are rows in the same table as documents.
pub type EntityId = DocumentId;

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Broadcast channel name for this document.
    pub fn channel_name(&self) -> String {
        format!("doc-{}", self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for DocumentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}
