//! In-process transport: channels opened on the same [`LocalHub`] see each
//! other's publishes.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use super::{BroadcastTransport, Channel, Topic, TopicRouter, TransportError};
use crate::broadcast::{ChannelGroup, ChannelRegistry, Envelope, GroupStats};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Delay between `open` and the channel becoming ready, standing in for
    /// a subscription handshake.
    pub ready_delay: Duration,
    /// Envelopes buffered per member before a slow member starts lagging.
    pub capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ready_delay: Duration::from_millis(20),
            capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            ready_delay: Duration::ZERO,
            capacity: 64,
        }
    }
}

struct HubInner {
    config: HubConfig,
    registry: ChannelRegistry,
    reachable: watch::Sender<bool>,
    reject_publishes: AtomicBool,
}

/// In-process [`BroadcastTransport`].
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new(config: HubConfig) -> Self {
        let registry = ChannelRegistry::new(config.capacity);
        let (reachable, _) = watch::channel(true);
        Self {
            inner: Arc::new(HubInner {
                config,
                registry,
                reachable,
                reject_publishes: AtomicBool::new(false),
            }),
        }
    }

    /// Take the hub offline (every channel loses readiness) or bring it
    /// back (channels rejoin).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.send_replace(reachable);
    }

    /// Make every publish fail with [`TransportError::Rejected`].
    pub fn reject_publishes(&self, reject: bool) {
        self.inner.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// Counters for a channel, if it currently exists.
    pub async fn stats(&self, channel: &str) -> Option<GroupStats> {
        match self.inner.registry.get(channel).await {
            Some(group) => Some(group.stats().await),
            None => None,
        }
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.registry.channel_count().await
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl BroadcastTransport for LocalHub {
    fn open(&self, name: &str) -> Result<Arc<dyn Channel>, TransportError> {
        let (ready, _) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = Arc::new(ChannelState {
            name: name.to_string(),
            member_id: Uuid::new_v4(),
            group: Mutex::new(None),
            router: TopicRouter::default(),
            ready,
            shutdown,
        });

        tokio::spawn(run_member(state.clone(), self.inner.clone(), shutdown_rx));
        debug!("Opened local channel {name}");

        Ok(Arc::new(LocalChannel {
            state,
            hub: self.inner.clone(),
        }))
    }
}

struct ChannelState {
    name: String,
    member_id: Uuid,
    group: Mutex<Option<Arc<ChannelGroup>>>,
    router: TopicRouter,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl ChannelState {
    fn set_group(&self, group: Option<Arc<ChannelGroup>>) {
        *self.group.lock().unwrap_or_else(|p| p.into_inner()) = group;
    }

    fn group(&self) -> Option<Arc<ChannelGroup>> {
        self.group.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

enum Exit {
    Shutdown,
    Unreachable,
}

/// Member loop: wait until the hub is reachable, join, forward envelopes
/// until shutdown or the hub goes away, then leave.
async fn run_member(
    state: Arc<ChannelState>,
    hub: Arc<HubInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reachable = hub.reachable.subscribe();

    loop {
        if !*reachable.borrow_and_update() {
            tokio::select! {
                res = reachable.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
                _ = shutdown.changed() => break,
            }
        }

        if !hub.config.ready_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(hub.config.ready_delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        let group = hub.registry.get_or_create(&state.name).await;
        let mut rx = group.join(state.member_id).await;
        state.set_group(Some(group.clone()));
        state.ready.send_replace(true);
        info!("Channel {} ready (member {})", state.name, state.member_id);

        let exit = loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(envelope) => {
                        if envelope.sender == state.member_id {
                            continue;
                        }
                        state.router.dispatch(envelope.topic, &envelope.payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Member {} lagged by {n} messages on {}", state.member_id, state.name);
                    }
                    Err(broadcast::error::RecvError::Closed) => break Exit::Shutdown,
                },
                res = reachable.changed() => {
                    if res.is_err() {
                        break Exit::Shutdown;
                    }
                    if !*reachable.borrow_and_update() {
                        break Exit::Unreachable;
                    }
                }
                _ = shutdown.changed() => break Exit::Shutdown,
            }
        };

        state.set_group(None);
        state.ready.send_replace(false);
        group.leave(&state.member_id).await;
        hub.registry.remove_if_empty(&state.name).await;

        match exit {
            Exit::Shutdown => break,
            Exit::Unreachable => info!("Channel {} lost readiness", state.name),
        }
    }

    state.ready.send_replace(false);
    state.router.clear();
    debug!("Local channel {} closed", state.name);
}

struct LocalChannel {
    state: Arc<ChannelState>,
    hub: Arc<HubInner>,
}

impl Channel for LocalChannel {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        if *self.state.shutdown.borrow() {
            return Err(TransportError::Closed(self.state.name.clone()));
        }
        let group = self
            .state
            .group()
            .ok_or_else(|| TransportError::NotReady(self.state.name.clone()))?;
        if self.hub.reject_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(self.state.name.clone()));
        }

        group.publish(Envelope {
            sender: self.state.member_id,
            topic,
            payload: Arc::from(payload),
        });
        Ok(())
    }

    fn subscribe(&self, topic: Topic) -> tokio::sync::mpsc::UnboundedReceiver<Vec<u8>> {
        self.state.router.subscribe(topic)
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.state.ready.subscribe()
    }

    fn close(&self) {
        self.state.shutdown.send_replace(true);
        self.state.set_group(None);
        self.state.ready.send_replace(false);
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}
