//! Optimistic, debounced whole-snapshot sync for structured entities.
//!
//! A mounted entity keeps its state locally. Mutations apply immediately and
//! arm a debounce timer; when the timer fires the whole entity is written as
//! one snapshot (last writer wins). Row-change notifications trigger a full
//! refetch, deferred while a gesture is in progress or a local write is
//! still pending.
//!
//! ```text
//! dispatch ──► state (watch) ──► Dirty ──► [debounce] ──► put_snapshot
//!                    ▲                                         │
//!                    └── refetch ◄── RowChange ◄── store feed ◄┘
//! ```

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::{EntityId, StructuredEntity};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::config::ReconcilerConfig;
use crate::storage::{RowChanges, RowFilter, SnapshotStore, DOCUMENTS_TABLE};

/// Mounts structured entities backed by one store.
#[derive(Clone)]
pub struct SnapshotReconciler {
    store: Arc<dyn SnapshotStore>,
    config: ReconcilerConfig,
}

impl SnapshotReconciler {
    pub fn new(store: Arc<dyn SnapshotStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Load `id` and start reconciling it. Must be called from within a
    /// tokio runtime.
    ///
    /// The initial state is the persisted snapshot, or `E::default()` when
    /// there is none or it cannot be decoded.
    pub fn mount<E: StructuredEntity>(&self, id: EntityId) -> MountedEntity<E> {
        let changes = self.store.on_row_changed(DOCUMENTS_TABLE, RowFilter::Id(id));
        let initial = load::<E>(self.store.as_ref(), id).unwrap_or_default();

        let (state, _) = watch::channel(initial);
        let shared = Arc::new(EntityShared {
            id,
            state,
            gesture_active: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            unmounted: AtomicBool::new(false),
        });
        let (signals, signals_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(
            shared.clone(),
            self.store.clone(),
            self.config.clone(),
            signals_rx,
            changes,
        ));
        info!("Mounted {} {id}", E::KIND);

        MountedEntity { shared, signals }
    }
}

/// Read and decode a snapshot. `None` when absent or unreadable.
fn load<E: StructuredEntity>(store: &dyn SnapshotStore, id: EntityId) -> Option<E> {
    match store.get_snapshot(id) {
        Ok(Some(bytes)) => match E::from_snapshot(&bytes) {
            Ok(entity) => Some(entity),
            Err(e) => {
                warn!("Ignoring undecodable {} snapshot {id}: {e}", E::KIND);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            error!("Failed to read {} snapshot {id}: {e}", E::KIND);
            None
        }
    }
}

struct EntityShared<E> {
    id: EntityId,
    state: watch::Sender<E>,
    gesture_active: AtomicBool,
    /// A local mutation has not been written yet.
    dirty: AtomicBool,
    unmounted: AtomicBool,
}

#[derive(Debug)]
enum Signal {
    Dirty,
    Refresh,
    Shutdown,
}

/// Handle to a mounted entity. Unmounts on drop.
pub struct MountedEntity<E: StructuredEntity> {
    shared: Arc<EntityShared<E>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl<E: StructuredEntity> MountedEntity<E> {
    pub fn id(&self) -> EntityId {
        self.shared.id
    }

    /// Current local state.
    pub fn state(&self) -> E {
        self.shared.state.borrow().clone()
    }

    /// Observe state changes, local and refetched.
    pub fn subscribe(&self) -> watch::Receiver<E> {
        self.shared.state.subscribe()
    }

    /// Apply `mutation` locally and schedule a persist. A rejected mutation
    /// changes nothing and schedules nothing.
    pub fn dispatch(&self, mutation: E::Mutation) -> Result<(), E::Error> {
        let mut outcome = Ok(());
        let dirty = &self.shared.dirty;
        self.shared.state.send_if_modified(|state| match state.apply(mutation) {
            Ok(()) => {
                dirty.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome?;

        if !self.shared.unmounted.load(Ordering::SeqCst) {
            let _ = self.signals.send(Signal::Dirty);
        }
        Ok(())
    }

    /// While active, inbound changes are not applied. Clearing it does not
    /// refetch by itself; the next notification or [`refresh`](Self::refresh)
    /// does.
    pub fn set_gesture_active(&self, active: bool) {
        self.shared.gesture_active.store(active, Ordering::SeqCst);
    }

    pub fn is_gesture_active(&self) -> bool {
        self.shared.gesture_active.load(Ordering::SeqCst)
    }

    /// A local mutation is waiting for its debounced write.
    pub fn has_pending_write(&self) -> bool {
        self.shared.dirty.load(Ordering::SeqCst)
    }

    /// Refetch from the store, subject to the same deferral rules as a
    /// change notification.
    pub fn refresh(&self) {
        let _ = self.signals.send(Signal::Refresh);
    }

    /// Stop reconciling. A pending debounced write is dropped; a write
    /// already in progress completes. Idempotent.
    pub fn unmount(&self) {
        if self.shared.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.signals.send(Signal::Shutdown);
        debug!("Unmounted {} {}", E::KIND, self.shared.id);
    }

    pub fn is_mounted(&self) -> bool {
        !self.shared.unmounted.load(Ordering::SeqCst)
    }
}

impl<E: StructuredEntity> Drop for MountedEntity<E> {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl<E: StructuredEntity> std::fmt::Debug for MountedEntity<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountedEntity")
            .field("kind", &E::KIND)
            .field("id", &self.shared.id)
            .field("pending_write", &self.has_pending_write())
            .finish()
    }
}

async fn run<E: StructuredEntity>(
    shared: Arc<EntityShared<E>>,
    store: Arc<dyn SnapshotStore>,
    config: ReconcilerConfig,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    changes: RowChanges,
) {
    let mut changes = Some(changes);
    let mut deadline: Option<Instant> = None;

    loop {
        let debounce = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let change = async {
            match changes.as_mut() {
                Some(feed) => feed.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            signal = signals.recv() => match signal {
                Some(Signal::Dirty) => deadline = Some(Instant::now() + config.debounce_window),
                Some(Signal::Refresh) => refetch(&shared, store.as_ref()),
                Some(Signal::Shutdown) | None => break,
            },
            _ = debounce => {
                deadline = None;
                persist(&shared, store.as_ref());
            }
            notification = change => match notification {
                Some(_) => refetch(&shared, store.as_ref()),
                None => {
                    warn!("Change feed for {} {} closed", E::KIND, shared.id);
                    changes = None;
                }
            },
        }
    }

    debug!("Reconciler for {} {} stopped", E::KIND, shared.id);
}

fn persist<E: StructuredEntity>(shared: &EntityShared<E>, store: &dyn SnapshotStore) {
    // Cleared first: a mutation racing the write re-arms the timer.
    shared.dirty.store(false, Ordering::SeqCst);
    let snapshot = match shared.state.borrow().to_snapshot() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to encode {} {}: {e}", E::KIND, shared.id);
            return;
        }
    };
    match store.put_snapshot(shared.id, &snapshot) {
        Ok(()) => debug!("Persisted {} {} ({} bytes)", E::KIND, shared.id, snapshot.len()),
        Err(e) => error!("Failed to persist {} {}: {e}", E::KIND, shared.id),
    }
}

/// Replace local state with the stored snapshot unless a gesture or an
/// unsaved local mutation is in the way.
fn refetch<E: StructuredEntity>(shared: &EntityShared<E>, store: &dyn SnapshotStore) {
    if shared.gesture_active.load(Ordering::SeqCst) || shared.dirty.load(Ordering::SeqCst) {
        debug!("Deferring refetch of {} {}", E::KIND, shared.id);
        return;
    }
    let Some(fresh) = load::<E>(store, shared.id) else {
        return;
    };
    let replaced = shared.state.send_if_modified(|state| {
        if shared.dirty.load(Ordering::SeqCst) || *state == fresh {
            return false;
        }
        *state = fresh;
        true
    });
    if replaced {
        debug!("Rebuilt {} {} from store", E::KIND, shared.id);
    }
}
