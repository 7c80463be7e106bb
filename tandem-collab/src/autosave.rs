//! Periodic persistence of an open document's content.

use log::{debug, error};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tandem_core::DocumentId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::provider::SyncProvider;
use crate::storage::SnapshotStore;

/// Saves `query_structure()` every interval when the document had a local,
/// unsuppressed change since the last save, and once more on close.
///
/// A failed save is logged and not retried until the next local change.
pub struct Autosave {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Autosave {
    pub fn spawn(
        provider: Arc<SyncProvider>,
        store: Arc<dyn SnapshotStore>,
        id: DocumentId,
        interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(provider, store, id, interval, shutdown_rx));
        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the loop after a final save, and wait for it.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for Autosave {
    fn drop(&mut self) {
        // The detached task still performs the final save.
        self.shutdown.send_replace(true);
    }
}

async fn run(
    provider: Arc<SyncProvider>,
    store: Arc<dyn SnapshotStore>,
    id: DocumentId,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut saved_mark = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                save_if_dirty(&provider, store.as_ref(), id, &mut saved_mark);
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                save_if_dirty(&provider, store.as_ref(), id, &mut saved_mark);
                break;
            }
        }
    }
    debug!("Autosave for {id} stopped");
}

/// Returns whether a save was attempted.
fn save_if_dirty(
    provider: &SyncProvider,
    store: &dyn SnapshotStore,
    id: DocumentId,
    saved_mark: &mut u64,
) -> bool {
    let current = provider.stats().local_changes;
    if current == *saved_mark {
        return false;
    }
    *saved_mark = current;

    let content = provider.document().query_structure();
    let blob = match serde_json::to_vec(&content) {
        Ok(blob) => blob,
        Err(e) => {
            error!("Could not serialize {id} for autosave: {e}");
            return true;
        }
    };
    match store.put_snapshot(id, &blob) {
        Ok(()) => debug!("Autosaved {id} ({} bytes)", blob.len()),
        Err(e) => error!("Autosave of {id} failed: {e}"),
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::presence::PresenceRegistry;
    use crate::storage::MemoryStore;
    use crate::transport::{HubConfig, LocalHub};
    use serde_json::{json, Value};
    use tandem_core::CollabDocument;
    use uuid::Uuid;

    fn provider(hub: &LocalHub, doc: Arc<CollabDocument>) -> Arc<SyncProvider> {
        Arc::new(
            SyncProvider::open(
                doc,
                hub,
                "doc-autosave",
                Arc::new(PresenceRegistry::new(Uuid::new_v4())),
                ProviderConfig::for_testing(),
            )
            .unwrap(),
        )
    }

    fn stored(store: &MemoryStore, id: DocumentId) -> Option<Value> {
        store
            .get_snapshot(id)
            .unwrap()
            .map(|blob| serde_json::from_slice(&blob).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_saves_only_after_local_changes() {
        let hub = LocalHub::new(HubConfig::for_testing());
        let doc = Arc::new(CollabDocument::new());
        let store = Arc::new(MemoryStore::new());
        let id = DocumentId::new();
        let autosave = Autosave::spawn(provider(&hub, doc.clone()), store.clone(), id, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.write_count(id), 0);

        doc.set_field("title", &json!("draft")).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(store.write_count(id), 1);
        assert_eq!(stored(&store, id), Some(json!({ "title": "draft" })));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.write_count(id), 1);
        autosave.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_saves_pending_changes() {
        let hub = LocalHub::new(HubConfig::for_testing());
        let doc = Arc::new(CollabDocument::new());
        let store = Arc::new(MemoryStore::new());
        let id = DocumentId::new();
        let autosave = Autosave::spawn(provider(&hub, doc.clone()), store.clone(), id, Duration::from_secs(5));

        doc.set_field("title", &json!("late")).unwrap();
        autosave.close().await;

        assert_eq!(stored(&store, id), Some(json!({ "title": "late" })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_is_not_retried() {
        let hub = LocalHub::new(HubConfig::for_testing());
        let doc = Arc::new(CollabDocument::new());
        let store = Arc::new(MemoryStore::new());
        let id = DocumentId::new();
        let autosave = Autosave::spawn(provider(&hub, doc.clone()), store.clone(), id, Duration::from_secs(5));

        store.fail_writes(true);
        doc.set_field("title", &json!("lost")).unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        store.fail_writes(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.write_count(id), 0);

        autosave.close().await;
        assert_eq!(store.write_count(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_changes_do_not_mark_dirty() {
        let hub = LocalHub::new(HubConfig::for_testing());
        let doc = Arc::new(CollabDocument::new());
        let store = Arc::new(MemoryStore::new());
        let id = DocumentId::new();
        let provider = provider(&hub, doc.clone());
        let autosave = Autosave::spawn(provider.clone(), store.clone(), id, Duration::from_secs(5));

        {
            let _guard = provider.try_suppress().unwrap();
            doc.set_field("title", &json!("hydrated")).unwrap();
        }
        autosave.close().await;
        assert_eq!(store.write_count(id), 0);
    }
}
