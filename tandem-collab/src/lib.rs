//! # tandem-collab — sync layer for Tandem workspaces
//!
//! Two consistency strategies run side by side:
//!
//! ```text
//! ┌────────────────┐  deltas + presence   ┌────────────────┐
//! │ SyncProvider   │ ◄──── channel ─────► │ SyncProvider   │
//! │ (client A)     │   "doc-<id>" relay   │ (client B)     │
//! └───────┬────────┘                      └───────┬────────┘
//!         │ SeedCoordinator / Autosave            │
//!         ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ SnapshotStore ("documents" table, change feed)          │
//! └─────────────────────────────────────────────────────────┘
//!         ▲
//!         │ debounced writes, refetch on row change
//! ┌───────┴────────────┐
//! │ SnapshotReconciler │  Board, FileTree
//! └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`provider`] — binds one document to one broadcast channel
//! - [`presence`] — per-document presence registry with clocks
//! - [`seed`] — one-shot hydration of an empty document from its snapshot
//! - [`reconciler`] — snapshot-synced structured entities
//! - [`autosave`] — periodic save of document content
//! - [`session`] — the [`Workspace`] facade
//! - [`transport`] — broadcast transports (in-process hub, WebSocket)
//! - [`relay`] — WebSocket relay server
//! - [`protocol`] — relay wire frames
//! - [`broadcast`] — channel groups with fan-out
//! - [`storage`] — snapshot stores (memory, RocksDB)

pub mod autosave;
pub mod broadcast;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod reconciler;
pub mod relay;
pub mod seed;
pub mod session;
pub mod storage;
pub mod transport;

pub use autosave::Autosave;
pub use broadcast::{ChannelGroup, ChannelRegistry, Envelope, GroupStats};
pub use config::{ProviderConfig, ReconcilerConfig, SeedConfig, WorkspaceConfig};
pub use presence::{color_for, PresenceChange, PresenceError, PresenceOrigin, PresenceRegistry};
pub use protocol::{FrameType, ProtocolError, RelayFrame};
pub use provider::{should_publish, ProviderState, ProviderStats, SuppressionGuard, SyncProvider};
pub use reconciler::{MountedEntity, SnapshotReconciler};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats};
pub use seed::{SeedCoordinator, SeedError, SeedOutcome};
pub use session::{DocumentSession, Identity, SessionError, Workspace};
pub use storage::{
    MemoryStore, RocksStore, RowChange, RowChanges, RowFilter, SnapshotMetadata, SnapshotStore,
    StoreConfig, StoreError, DOCUMENTS_TABLE,
};
pub use transport::{
    BroadcastTransport, Channel, HubConfig, LocalHub, Topic, TransportError, WsTransport,
};
