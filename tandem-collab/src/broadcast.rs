//! Fan-out of channel traffic to every member of a named channel.
//!
//! Each channel gets a tokio broadcast channel; every member holds its own
//! receiver buffering up to `capacity` envelopes. Members filter out their
//! own envelopes on receipt.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::transport::Topic;

/// One published message as seen by channel members.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Uuid,
    pub topic: Topic,
    pub payload: Arc<[u8]>,
}

/// Counters for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub updates_sent: u64,
    pub awareness_sent: u64,
    pub active_members: usize,
}

impl GroupStats {
    pub fn messages_sent(&self) -> u64 {
        self.updates_sent + self.awareness_sent
    }
}

#[derive(Default)]
struct AtomicGroupStats {
    updates_sent: AtomicU64,
    awareness_sent: AtomicU64,
}

/// Members and fan-out sender for one named channel.
pub struct ChannelGroup {
    name: String,
    sender: broadcast::Sender<Envelope>,
    members: RwLock<HashSet<Uuid>>,
    capacity: usize,
    stats: AtomicGroupStats,
}

impl ChannelGroup {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
            members: RwLock::new(HashSet::new()),
            capacity,
            stats: AtomicGroupStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a member and hand back its receiver.
    pub async fn join(&self, member: Uuid) -> broadcast::Receiver<Envelope> {
        self.members.write().await.insert(member);
        self.sender.subscribe()
    }

    pub async fn leave(&self, member: &Uuid) -> bool {
        self.members.write().await.remove(member)
    }

    /// Send to every receiver, the sender's own included. Returns the number
    /// of receivers reached.
    pub fn publish(&self, envelope: Envelope) -> usize {
        let counter = match envelope.topic {
            Topic::Update => &self.stats.updates_sent,
            Topic::Awareness => &self.stats.awareness_sent,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_member(&self, member: &Uuid) -> bool {
        self.members.read().await.contains(member)
    }

    pub async fn stats(&self) -> GroupStats {
        GroupStats {
            updates_sent: self.stats.updates_sent.load(Ordering::Relaxed),
            awareness_sent: self.stats.awareness_sent.load(Ordering::Relaxed),
            active_members: self.member_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps channel names to their groups.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<ChannelGroup>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, name: &str) -> Arc<ChannelGroup> {
        {
            let channels = self.channels.read().await;
            if let Some(group) = channels.get(name) {
                return group.clone();
            }
        }

        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(name) {
            return group.clone();
        }

        let group = Arc::new(ChannelGroup::new(name, self.default_capacity));
        channels.insert(name.to_string(), group.clone());
        group
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ChannelGroup>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Drop a channel once its last member has left.
    pub async fn remove_if_empty(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(group) = channels.get(name) {
            if group.member_count().await == 0 {
                channels.remove(name);
                return true;
            }
        }
        false
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }
}
