//! One-shot hydration of a freshly opened document.
//!
//! After the provider connects and a short grace period has let peers'
//! deltas arrive, the live document is seeded from its persisted snapshot
//! only if it is still structurally empty when the replace commits. The replace runs under
//! suppression so peers never receive it as an update; they hydrate from
//! the same snapshot themselves.

use log::{debug, info};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_core::json::is_empty_value;
use tandem_core::{DocumentError, DocumentId};
use thiserror::Error;

use crate::config::SeedConfig;
use crate::provider::{ProviderState, SyncProvider};
use crate::storage::{SnapshotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Content replaced from the snapshot.
    Hydrated,
    /// The document already had content, presumably from peers.
    LiveStateNotEmpty,
    /// No snapshot, or an empty one.
    NoSnapshot,
    /// The per-open marker was already set.
    AlreadyHydrated,
    /// Someone else holds the suppression gate.
    SuppressionBusy,
    /// The provider was destroyed before hydration finished.
    ProviderClosed,
    /// Reading the snapshot or writing the document failed.
    Failed,
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("snapshot of {id} is not valid JSON: {source}")]
    Snapshot {
        id: DocumentId,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, Default)]
pub struct SeedCoordinator {
    config: SeedConfig,
}

impl SeedCoordinator {
    pub fn new(config: SeedConfig) -> Self {
        Self { config }
    }

    /// Run the handshake for document `id`.
    ///
    /// `hydrated` is the per-open marker; it is set once a hydration starts
    /// and reset if that hydration fails before writing.
    pub async fn run(
        &self,
        provider: &SyncProvider,
        store: &dyn SnapshotStore,
        id: DocumentId,
        hydrated: &AtomicBool,
    ) -> Result<SeedOutcome, SeedError> {
        if !provider.wait_connected().await {
            return Ok(SeedOutcome::ProviderClosed);
        }
        tokio::time::sleep(self.config.grace).await;
        if provider.state() == ProviderState::Disconnected {
            return Ok(SeedOutcome::ProviderClosed);
        }
        if hydrated.load(Ordering::SeqCst) {
            return Ok(SeedOutcome::AlreadyHydrated);
        }

        let document = provider.document();
        if !document.is_structurally_empty() {
            debug!("Seed {id}: live state present, keeping it");
            return Ok(SeedOutcome::LiveStateNotEmpty);
        }

        let Some(blob) = store.get_snapshot(id)? else {
            return Ok(SeedOutcome::NoSnapshot);
        };
        if blob.is_empty() {
            return Ok(SeedOutcome::NoSnapshot);
        }
        let content: Value =
            serde_json::from_slice(&blob).map_err(|source| SeedError::Snapshot { id, source })?;
        if snapshot_is_empty(&content) {
            return Ok(SeedOutcome::NoSnapshot);
        }

        if hydrated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(SeedOutcome::AlreadyHydrated);
        }
        let Some(guard) = provider.try_suppress() else {
            hydrated.store(false, Ordering::SeqCst);
            return Ok(SeedOutcome::SuppressionBusy);
        };

        // Peers' deltas may have landed since the check above; emptiness is
        // decided again inside the replacing transaction.
        let seq = match document.replace_if_empty(&content) {
            Ok(Some(seq)) => seq,
            Ok(None) => {
                hydrated.store(false, Ordering::SeqCst);
                debug!("Seed {id}: live state arrived while loading, keeping it");
                return Ok(SeedOutcome::LiveStateNotEmpty);
            }
            Err(e) => {
                hydrated.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let observed = provider.wait_observed(seq).await;
        drop(guard);

        if !observed {
            return Ok(SeedOutcome::ProviderClosed);
        }
        info!("Hydrated {id} from snapshot (seq {seq})");
        Ok(SeedOutcome::Hydrated)
    }
}

fn snapshot_is_empty(content: &Value) -> bool {
    match content {
        Value::Object(fields) => {
            fields.is_empty() || (fields.len() == 1 && fields.values().all(is_empty_value))
        }
        other => is_empty_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::presence::PresenceRegistry;
    use crate::storage::{MemoryStore, RowChanges, RowFilter};
    use crate::transport::{HubConfig, LocalHub};
    use serde_json::json;
    use std::sync::Arc;
    use tandem_core::{CollabDocument, MergeableDocument, OriginTag};
    use uuid::Uuid;

    struct Fixture {
        _hub: LocalHub,
        doc: Arc<CollabDocument>,
        provider: SyncProvider,
        store: MemoryStore,
        id: DocumentId,
    }

    fn fixture() -> Fixture {
        let hub = LocalHub::new(HubConfig::for_testing());
        let doc = Arc::new(CollabDocument::new());
        let id = DocumentId::new();
        let provider = SyncProvider::open(
            doc.clone(),
            &hub,
            &id.channel_name(),
            Arc::new(PresenceRegistry::new(Uuid::new_v4())),
            ProviderConfig::for_testing(),
        )
        .unwrap();
        Fixture {
            _hub: hub,
            doc,
            provider,
            store: MemoryStore::new(),
            id,
        }
    }

    /// Store whose read lets a peer's delta land in `doc` first, as when
    /// an update arrives while the snapshot is loading.
    struct RacingStore {
        inner: MemoryStore,
        doc: Arc<CollabDocument>,
        peer_update: Vec<u8>,
    }

    impl SnapshotStore for RacingStore {
        fn get_snapshot(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
            self.doc
                .apply_encoded(&self.peer_update, OriginTag::RemoteApplied)
                .unwrap();
            self.inner.get_snapshot(id)
        }

        fn put_snapshot(&self, id: DocumentId, blob: &[u8]) -> Result<(), StoreError> {
            self.inner.put_snapshot(id, blob)
        }

        fn on_row_changed(&self, table: &str, filter: RowFilter) -> RowChanges {
            self.inner.on_row_changed(table, filter)
        }
    }

    fn coordinator() -> SeedCoordinator {
        SeedCoordinator::new(SeedConfig::for_testing())
    }

    #[tokio::test]
    async fn test_empty_document_is_hydrated_silently() {
        let f = fixture();
        f.store
            .put_snapshot(f.id, br#"{"title":"A"}"#)
            .unwrap();
        let marker = AtomicBool::new(false);

        let outcome = coordinator()
            .run(&f.provider, &f.store, f.id, &marker)
            .await
            .unwrap();

        assert_eq!(outcome, SeedOutcome::Hydrated);
        assert_eq!(f.doc.query_structure(), json!({ "title": "A" }));
        assert!(marker.load(Ordering::SeqCst));
        assert!(!f.provider.is_suppressed());
        assert_eq!(f.provider.stats().updates_published, 0);
        assert_eq!(f.provider.stats().updates_suppressed, 1);
    }

    #[tokio::test]
    async fn test_live_content_wins_over_snapshot() {
        let f = fixture();
        f.store.put_snapshot(f.id, br#"{"title":"old"}"#).unwrap();
        f.doc.set_field("title", &json!("live")).unwrap();

        let outcome = coordinator()
            .run(&f.provider, &f.store, f.id, &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(outcome, SeedOutcome::LiveStateNotEmpty);
        assert_eq!(f.doc.query_structure(), json!({ "title": "live" }));
    }

    #[tokio::test]
    async fn test_delta_arriving_during_load_is_kept() {
        let f = fixture();
        let peer = CollabDocument::new();
        peer.set_field("title", &json!("from peer")).unwrap();
        let store = RacingStore {
            inner: MemoryStore::new(),
            doc: f.doc.clone(),
            peer_update: peer.encode_state(),
        };
        store.put_snapshot(f.id, br#"{"title":"stale"}"#).unwrap();
        let marker = AtomicBool::new(false);

        let outcome = coordinator()
            .run(&f.provider, &store, f.id, &marker)
            .await
            .unwrap();

        assert_eq!(outcome, SeedOutcome::LiveStateNotEmpty);
        assert_eq!(f.doc.query_structure(), json!({ "title": "from peer" }));
        assert!(!marker.load(Ordering::SeqCst));
        assert!(!f.provider.is_suppressed());
        assert_eq!(f.provider.stats().updates_suppressed, 0);
    }

    #[tokio::test]
    async fn test_single_empty_node_counts_as_empty() {
        let f = fixture();
        f.store.put_snapshot(f.id, br#"{"body":"text"}"#).unwrap();
        f.doc.set_field("body", &json!("")).unwrap();

        let outcome = coordinator()
            .run(&f.provider, &f.store, f.id, &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(outcome, SeedOutcome::Hydrated);
        assert_eq!(f.doc.text("body").as_deref(), Some("text"));
    }

    #[tokio::test]
    async fn test_missing_or_empty_snapshot() {
        let f = fixture();
        let marker = AtomicBool::new(false);
        assert_eq!(
            coordinator().run(&f.provider, &f.store, f.id, &marker).await.unwrap(),
            SeedOutcome::NoSnapshot
        );

        f.store.put_snapshot(f.id, b"{}").unwrap();
        assert_eq!(
            coordinator().run(&f.provider, &f.store, f.id, &marker).await.unwrap(),
            SeedOutcome::NoSnapshot
        );
        assert!(!marker.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_marker_prevents_second_hydration() {
        let f = fixture();
        f.store.put_snapshot(f.id, br#"{"title":"A"}"#).unwrap();
        let marker = AtomicBool::new(true);

        let outcome = coordinator()
            .run(&f.provider, &f.store, f.id, &marker)
            .await
            .unwrap();
        assert_eq!(outcome, SeedOutcome::AlreadyHydrated);
        assert!(f.doc.is_structurally_empty());
    }

    #[tokio::test]
    async fn test_busy_suppression_releases_marker() {
        let f = fixture();
        f.store.put_snapshot(f.id, br#"{"title":"A"}"#).unwrap();
        let marker = AtomicBool::new(false);
        let _held = f.provider.try_suppress().unwrap();

        let outcome = coordinator()
            .run(&f.provider, &f.store, f.id, &marker)
            .await
            .unwrap();
        assert_eq!(outcome, SeedOutcome::SuppressionBusy);
        assert!(!marker.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_malformed_snapshot_is_an_error() {
        let f = fixture();
        f.store.put_snapshot(f.id, b"{not json").unwrap();

        let result = coordinator()
            .run(&f.provider, &f.store, f.id, &AtomicBool::new(false))
            .await;
        assert!(matches!(result, Err(SeedError::Snapshot { .. })));
    }

    #[tokio::test]
    async fn test_destroyed_provider_reports_closed() {
        let f = fixture();
        f.provider.destroy();
        let outcome = coordinator()
            .run(&f.provider, &f.store, f.id, &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(outcome, SeedOutcome::ProviderClosed);
    }

    #[test]
    fn test_snapshot_emptiness() {
        assert!(snapshot_is_empty(&json!({})));
        assert!(snapshot_is_empty(&json!({ "body": "" })));
        assert!(snapshot_is_empty(&json!(null)));
        assert!(!snapshot_is_empty(&json!({ "body": "x" })));
        assert!(!snapshot_is_empty(&json!({ "a": "", "b": "" })));
    }
}
