//! Upward API of the sync layer.
//!
//! A [`Workspace`] is one client session: it owns the local identity, the
//! transport and store handles, and the registries of open documents and
//! mounted entities. Opening a document wires a [`CollabDocument`], a
//! [`PresenceRegistry`], a [`SyncProvider`], the seed handshake and the
//! autosave loop together.

use log::{error, info};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tandem_core::{CollabDocument, DocumentId, EntityId, StructuredEntity};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autosave::Autosave;
use crate::config::WorkspaceConfig;
use crate::presence::{color_for, PresenceRegistry};
use crate::provider::SyncProvider;
use crate::reconciler::{MountedEntity, SnapshotReconciler};
use crate::seed::{SeedCoordinator, SeedOutcome};
use crate::storage::SnapshotStore;
use crate::transport::{BroadcastTransport, TransportError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("document {0} is already open in this session")]
    AlreadyOpen(DocumentId),
    #[error("entity {0} is already mounted in this session")]
    AlreadyMounted(EntityId),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How this client appears to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable per workspace; seeds the colour. Presence entries are keyed
    /// by a per-session id instead.
    pub client_id: Uuid,
    pub display_name: String,
    /// `#rrggbb`, derived from `client_id`.
    pub color: String,
}

impl Identity {
    pub fn new(display_name: impl Into<String>) -> Self {
        let client_id = Uuid::new_v4();
        Self {
            client_id,
            display_name: display_name.into(),
            color: color_for(client_id),
        }
    }

    /// Presence state announced on every open document.
    pub fn presence_state(&self) -> Value {
        json!({
            "user": {
                "name": self.display_name,
                "color": self.color,
            }
        })
    }
}

type OpenSet = Arc<Mutex<HashSet<DocumentId>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Type-erased handle so entities of any kind can be unmounted by id.
trait Mounted: Send + Sync {
    fn unmount(&self);
}

impl<E: StructuredEntity> Mounted for MountedEntity<E> {
    fn unmount(&self) {
        MountedEntity::unmount(self);
    }
}

/// One client session.
pub struct Workspace {
    config: WorkspaceConfig,
    identity: Identity,
    transport: Arc<dyn BroadcastTransport>,
    store: Arc<dyn SnapshotStore>,
    reconciler: SnapshotReconciler,
    seed: SeedCoordinator,
    open: OpenSet,
    mounted: Mutex<HashMap<EntityId, Arc<dyn Mounted>>>,
}

impl Workspace {
    pub fn new(
        config: WorkspaceConfig,
        transport: Arc<dyn BroadcastTransport>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let identity = Identity::new(config.display_name.clone());
        let reconciler = SnapshotReconciler::new(store.clone(), config.reconciler.clone());
        let seed = SeedCoordinator::new(config.seed.clone());
        info!(
            "Workspace for {} ({}) ready",
            identity.display_name, identity.client_id
        );
        Self {
            config,
            identity,
            transport,
            store,
            reconciler,
            seed,
            open: Arc::new(Mutex::new(HashSet::new())),
            mounted: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn is_open(&self, id: DocumentId) -> bool {
        lock(&self.open).contains(&id)
    }

    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }

    /// Open `id` for collaborative editing. Rejected if the document is
    /// already open in this workspace.
    pub fn open_document(&self, id: DocumentId) -> Result<DocumentSession, SessionError> {
        if !lock(&self.open).insert(id) {
            return Err(SessionError::AlreadyOpen(id));
        }

        let document = Arc::new(CollabDocument::new());
        // Fresh presence id per session: peers keep the tombstone of the
        // previous one, whose clock a restarted registry could not beat.
        let presence = Arc::new(PresenceRegistry::new(Uuid::new_v4()));
        presence.set_local(self.identity.presence_state());

        let provider = match SyncProvider::open(
            document.clone(),
            self.transport.as_ref(),
            &id.channel_name(),
            presence,
            self.config.provider.clone(),
        ) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                lock(&self.open).remove(&id);
                return Err(e.into());
            }
        };

        let (seed_tx, seed_rx) = watch::channel(None);
        let seed_task = tokio::spawn({
            let seed = self.seed.clone();
            let provider = provider.clone();
            let store = self.store.clone();
            async move {
                let hydrated = AtomicBool::new(false);
                let outcome = match seed.run(&provider, store.as_ref(), id, &hydrated).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Seeding {id} failed: {e}");
                        SeedOutcome::Failed
                    }
                };
                seed_tx.send_replace(Some(outcome));
            }
        });

        let autosave = Autosave::spawn(
            provider.clone(),
            self.store.clone(),
            id,
            self.config.autosave_interval,
        );
        info!("Opened document {id}");

        Ok(DocumentSession {
            id,
            document,
            provider,
            seed: seed_rx,
            seed_task,
            autosave,
            open: self.open.clone(),
        })
    }

    /// Close a session: final autosave, then teardown.
    pub async fn close_document(&self, session: DocumentSession) {
        session.autosave.close().await;
        drop(session);
    }

    /// Mount a structured entity. Rejected if `id` is already mounted.
    pub fn mount_structured_entity<E: StructuredEntity>(
        &self,
        id: EntityId,
    ) -> Result<Arc<MountedEntity<E>>, SessionError> {
        let mut mounted = lock(&self.mounted);
        if mounted.contains_key(&id) {
            return Err(SessionError::AlreadyMounted(id));
        }
        let entity = Arc::new(self.reconciler.mount::<E>(id));
        mounted.insert(id, entity.clone());
        Ok(entity)
    }

    /// Unmount `id`. Returns `false` if it was not mounted.
    pub fn unmount(&self, id: EntityId) -> bool {
        let entity = lock(&self.mounted).remove(&id);
        match entity {
            Some(entity) => {
                entity.unmount();
                true
            }
            None => false,
        }
    }

    pub fn mounted_count(&self) -> usize {
        lock(&self.mounted).len()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        for (_, entity) in lock(&self.mounted).drain() {
            entity.unmount();
        }
    }
}

/// An open collaborative document. Dropping it tears the session down;
/// prefer [`Workspace::close_document`], which waits for the final save.
pub struct DocumentSession {
    id: DocumentId,
    document: Arc<CollabDocument>,
    provider: Arc<SyncProvider>,
    seed: watch::Receiver<Option<SeedOutcome>>,
    seed_task: JoinHandle<()>,
    autosave: Autosave,
    open: OpenSet,
}

impl DocumentSession {
    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn document(&self) -> &Arc<CollabDocument> {
        &self.document
    }

    pub fn provider(&self) -> &Arc<SyncProvider> {
        &self.provider
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        self.provider.presence()
    }

    /// Outcome of the seed handshake, once it has run.
    pub async fn seed_outcome(&self) -> SeedOutcome {
        let mut seed = self.seed.clone();
        let outcome = match seed.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(SeedOutcome::ProviderClosed),
            Err(_) => SeedOutcome::ProviderClosed,
        };
        outcome
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.provider.destroy();
        self.seed_task.abort();
        lock(&self.open).remove(&self.id);
        info!("Closed document {}", self.id);
    }
}

impl std::fmt::Debug for DocumentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentSession")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .finish()
    }
}
