//! Bridge between one [`MergeableDocument`] and one broadcast channel.
//!
//! ```text
//!            on_change (Local)                 publish(update)
//! document ──────────────────► should_publish ─────────────────► channel
//!    ▲                                                             │
//!    └──────── apply_encoded(RemoteApplied) ◄── pump task ◄────────┘
//! ```
//!
//! Loop prevention needs no dedup table: remote deltas are applied with
//! [`OriginTag::RemoteApplied`] and the document listener only publishes
//! [`OriginTag::Local`] changes. Presence travels the same way on the
//! `awareness` topic.
//!
//! The provider sends nothing while the channel is not ready and keeps no
//! outbox. Changes made while disconnected reach peers only through a later
//! snapshot.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tandem_core::{DocChange, MergeableDocument, OriginTag, Subscription};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::presence::{PresenceChange, PresenceOrigin, PresenceRegistry};
use crate::transport::{BroadcastTransport, Channel, Topic, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Destroyed. Terminal.
    Disconnected,
    /// Waiting for the channel to become ready.
    Connecting,
    Connected,
}

/// Whether a document change is sent to peers.
pub fn should_publish(origin: OriginTag, state: ProviderState, suppressed: bool) -> bool {
    origin == OriginTag::Local && state == ProviderState::Connected && !suppressed
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    /// Local, unsuppressed document changes, published or not.
    pub local_changes: u64,
    pub updates_published: u64,
    pub updates_suppressed: u64,
    /// Remote deltas seen by the document listener and not republished.
    pub echoes_dropped: u64,
    pub decode_failures: u64,
    pub presence_published: u64,
    pub presence_received: u64,
}

#[derive(Default)]
struct Counters {
    local_changes: AtomicU64,
    updates_published: AtomicU64,
    updates_suppressed: AtomicU64,
    echoes_dropped: AtomicU64,
    decode_failures: AtomicU64,
    presence_published: AtomicU64,
    presence_received: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProviderStats {
        ProviderStats {
            local_changes: self.local_changes.load(Ordering::Relaxed),
            updates_published: self.updates_published.load(Ordering::Relaxed),
            updates_suppressed: self.updates_suppressed.load(Ordering::Relaxed),
            echoes_dropped: self.echoes_dropped.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            presence_published: self.presence_published.load(Ordering::Relaxed),
            presence_received: self.presence_received.load(Ordering::Relaxed),
        }
    }
}

struct Shared {
    channel: Arc<dyn Channel>,
    document: Arc<dyn MergeableDocument>,
    presence: Arc<PresenceRegistry>,
    config: ProviderConfig,
    state: watch::Sender<ProviderState>,
    suppressed: AtomicBool,
    observed: watch::Sender<u64>,
    destroyed: AtomicBool,
    pending_presence: Mutex<HashSet<Uuid>>,
    presence_flush: Notify,
    counters: Counters,
}

impl Shared {
    fn current_state(&self) -> ProviderState {
        *self.state.borrow()
    }

    fn on_document_change(&self, change: &DocChange) {
        let suppressed = self.suppressed.load(Ordering::SeqCst);
        let state = self.current_state();

        match change.origin {
            OriginTag::Local if suppressed => Counters::bump(&self.counters.updates_suppressed),
            OriginTag::Local => Counters::bump(&self.counters.local_changes),
            OriginTag::RemoteApplied => Counters::bump(&self.counters.echoes_dropped),
        }

        if should_publish(change.origin, state, suppressed) {
            match self.channel.publish(Topic::Update, change.update.to_vec()) {
                Ok(()) => Counters::bump(&self.counters.updates_published),
                Err(e) => warn!("Dropping update seq={} on {}: {e}", change.seq, self.channel.name()),
            }
        }

        self.observed.send_modify(|seen| *seen = (*seen).max(change.seq));
    }

    fn on_presence_change(&self, change: &PresenceChange) {
        if change.origin != PresenceOrigin::Local {
            return;
        }
        self.pending_presence
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(change.ids());
        self.presence_flush.notify_one();
    }

    fn apply_remote_update(&self, bytes: &[u8]) {
        match self.document.apply_encoded(bytes, OriginTag::RemoteApplied) {
            Ok(Some(seq)) => debug!("Applied remote update seq={seq} on {}", self.channel.name()),
            Ok(None) => debug!("Remote update on {} carried nothing new", self.channel.name()),
            Err(e) => {
                Counters::bump(&self.counters.decode_failures);
                warn!("Dropping malformed update on {}: {e}", self.channel.name());
            }
        }
    }

    fn apply_remote_presence(&self, bytes: &[u8]) {
        match self.presence.apply_partial(bytes) {
            Ok(_) => Counters::bump(&self.counters.presence_received),
            Err(e) => {
                Counters::bump(&self.counters.decode_failures);
                warn!("Dropping malformed presence on {}: {e}", self.channel.name());
            }
        }
    }

    fn publish_presence(&self, ids: &[Uuid]) {
        let payload = match self.presence.encode_partial(ids) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode presence for {}: {e}", self.channel.name());
                return;
            }
        };
        match self.channel.publish(Topic::Awareness, payload) {
            Ok(()) => Counters::bump(&self.counters.presence_published),
            Err(e) => warn!("Dropping presence on {}: {e}", self.channel.name()),
        }
    }

    /// Publish the latest state of every client changed since the last
    /// flush, as one message.
    fn flush_presence(&self) {
        let ids: Vec<Uuid> = self
            .pending_presence
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .collect();
        if ids.is_empty() || self.current_state() != ProviderState::Connected {
            return;
        }
        self.publish_presence(&ids);
    }

    fn handle_ready(&self, ready: bool) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let state = self.current_state();
        if ready && state != ProviderState::Connected {
            self.state.send_replace(ProviderState::Connected);
            info!("Provider connected to {}", self.channel.name());
            if self.presence.local_state().is_some() {
                self.publish_presence(&[self.presence.local_id()]);
            }
        } else if !ready && state == ProviderState::Connected {
            self.state.send_replace(ProviderState::Connecting);
            let dropped = self.presence.clear_remote();
            info!(
                "Provider lost {} (cleared {} peers)",
                self.channel.name(),
                dropped.len()
            );
        }
    }
}

/// Owns the document/channel coupling for one open document.
pub struct SyncProvider {
    shared: Arc<Shared>,
    subscriptions: Mutex<Vec<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncProvider {
    /// Open `channel_name` on `transport` and start relaying. Must be called
    /// from within a tokio runtime.
    pub fn open(
        document: Arc<dyn MergeableDocument>,
        transport: &dyn BroadcastTransport,
        channel_name: &str,
        presence: Arc<PresenceRegistry>,
        config: ProviderConfig,
    ) -> Result<Self, TransportError> {
        let channel = transport.open(channel_name)?;
        let (state, _) = watch::channel(ProviderState::Connecting);
        let (observed, _) = watch::channel(0);

        let shared = Arc::new(Shared {
            channel,
            document,
            presence,
            config,
            state,
            suppressed: AtomicBool::new(false),
            observed,
            destroyed: AtomicBool::new(false),
            pending_presence: Mutex::new(HashSet::new()),
            presence_flush: Notify::new(),
            counters: Counters::default(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let doc_sub = shared.document.on_change(Box::new(move |change: &DocChange| {
            if let Some(shared) = weak.upgrade() {
                shared.on_document_change(change);
            }
        }));
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let presence_sub = shared.presence.on_change(move |change| {
            if let Some(shared) = weak.upgrade() {
                shared.on_presence_change(change);
            }
        });

        // Subscribed before the pump is scheduled so frames arriving in
        // between are queued, not dropped.
        let inbound = Inbound {
            updates: shared.channel.subscribe(Topic::Update),
            awareness: shared.channel.subscribe(Topic::Awareness),
        };
        let task = tokio::spawn(pump(shared.clone(), inbound));
        debug!("Provider opened {channel_name}");

        Ok(Self {
            shared,
            subscriptions: Mutex::new(vec![doc_sub, presence_sub]),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn channel_name(&self) -> &str {
        self.shared.channel.name()
    }

    pub fn state(&self) -> ProviderState {
        self.shared.current_state()
    }

    pub fn state_watch(&self) -> watch::Receiver<ProviderState> {
        self.shared.state.subscribe()
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.shared.presence
    }

    pub fn document(&self) -> &Arc<dyn MergeableDocument> {
        &self.shared.document
    }

    pub fn stats(&self) -> ProviderStats {
        self.shared.counters.snapshot()
    }

    pub fn is_suppressed(&self) -> bool {
        self.shared.suppressed.load(Ordering::SeqCst)
    }

    /// Stop publishing local changes until the guard is dropped. `None` if
    /// suppression is already held.
    pub fn try_suppress(&self) -> Option<SuppressionGuard<'_>> {
        self.shared
            .suppressed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SuppressionGuard {
                flag: &self.shared.suppressed,
            })
    }

    /// Resolve once the document listener has seen change `seq`. `false` if
    /// the provider was destroyed first.
    pub async fn wait_observed(&self, seq: u64) -> bool {
        let mut observed = self.shared.observed.subscribe();
        let mut state = self.shared.state.subscribe();
        tokio::select! {
            res = observed.wait_for(|seen| *seen >= seq) => res.is_ok(),
            _ = state.wait_for(|s| *s == ProviderState::Disconnected) => false,
        }
    }

    /// Resolve once connected (`true`) or destroyed (`false`).
    pub async fn wait_connected(&self) -> bool {
        let mut state = self.shared.state.subscribe();
        let connected = match state.wait_for(|s| *s != ProviderState::Connecting).await {
            Ok(s) => *s == ProviderState::Connected,
            Err(_) => false,
        };
        connected
    }

    /// Tear down. Idempotent; also run on drop.
    ///
    /// A connected provider announces the local client's departure before
    /// the channel is closed.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();

        let presence = &self.shared.presence;
        if self.shared.current_state() == ProviderState::Connected && presence.local_state().is_some() {
            presence.clear_local();
            self.shared.publish_presence(&[presence.local_id()]);
        }

        self.shared.state.send_replace(ProviderState::Disconnected);
        self.shared.channel.close();
        if let Some(task) = self.task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        presence.destroy();
        info!("Provider for {} destroyed", self.shared.channel.name());
    }
}

impl Drop for SyncProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for SyncProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProvider")
            .field("channel", &self.channel_name())
            .field("state", &self.state())
            .field("suppressed", &self.is_suppressed())
            .finish()
    }
}

/// Holds the suppression flag; clears it on drop.
#[must_use = "suppression ends when the guard is dropped"]
pub struct SuppressionGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

struct Inbound {
    updates: mpsc::UnboundedReceiver<Vec<u8>>,
    awareness: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn pump(shared: Arc<Shared>, inbound: Inbound) {
    let Inbound {
        mut updates,
        mut awareness,
    } = inbound;
    let mut ready = shared.channel.ready();

    let period = shared.config.presence_renew_interval;
    let mut renew = tokio::time::interval_at(Instant::now() + period, period);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let initially_ready = *ready.borrow_and_update();
    shared.handle_ready(initially_ready);

    loop {
        tokio::select! {
            msg = updates.recv() => match msg {
                Some(bytes) => shared.apply_remote_update(&bytes),
                None => break,
            },
            msg = awareness.recv() => match msg {
                Some(bytes) => shared.apply_remote_presence(&bytes),
                None => break,
            },
            res = ready.changed() => {
                if res.is_err() {
                    break;
                }
                let now_ready = *ready.borrow_and_update();
                shared.handle_ready(now_ready);
            }
            _ = shared.presence_flush.notified() => shared.flush_presence(),
            _ = renew.tick() => {
                if shared.current_state() == ProviderState::Connected {
                    shared.presence.renew_local();
                    let expired = shared.presence.remove_stale(shared.config.presence_timeout);
                    if !expired.is_empty() {
                        debug!("Expired {} peers on {}", expired.len(), shared.channel.name());
                    }
                }
            }
        }
    }

    // The channel went away without a destroy.
    shared.handle_ready(false);
    debug!("Provider pump for {} finished", shared.channel.name());
}
