//! Named-channel publish/subscribe.
//!
//! Delivery is at-least-once while a channel is ready and nothing is
//! persisted: a publish while not ready fails and the payload is lost.
//!
//! Two implementations:
//! - [`LocalHub`] routes between channels in the same process.
//! - [`WsTransport`] connects each channel to a [`RelayServer`](crate::relay::RelayServer).

mod local;
mod ws;

pub use local::{HubConfig, LocalHub};
pub use ws::WsTransport;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::protocol::ProtocolError;

/// Topics carried on every document channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Encoded document deltas.
    Update,
    /// Presence updates.
    Awareness,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Update => "update",
            Topic::Awareness => "awareness",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel `{0}` is not ready")]
    NotReady(String),
    #[error("channel `{0}` is closed")]
    Closed(String),
    #[error("publish on `{0}` rejected by transport")]
    Rejected(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Factory for channels.
pub trait BroadcastTransport: Send + Sync + 'static {
    /// Open `name`. The channel becomes ready asynchronously; watch
    /// [`Channel::ready`]. Must be called from within a tokio runtime.
    fn open(&self, name: &str) -> Result<Arc<dyn Channel>, TransportError>;
}

/// One open channel.
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Publish to every other member. Fails when the channel is not ready.
    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Receive payloads published by other members on `topic`.
    fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<Vec<u8>>;

    /// `true` while the transport has acknowledged the channel.
    fn ready(&self) -> watch::Receiver<bool>;

    /// Leave the channel. Idempotent; subscriptions end.
    fn close(&self);
}

/// Per-topic subscriber lists shared by the channel implementations.
#[derive(Default)]
pub(crate) struct TopicRouter {
    subscribers: Mutex<HashMap<Topic, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl TopicRouter {
    pub(crate) fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().entry(topic).or_default().push(tx);
        rx
    }

    /// Deliver to live subscribers, pruning closed ones. Returns how many
    /// subscribers received the payload.
    pub(crate) fn dispatch(&self, topic: Topic, payload: &[u8]) -> usize {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&topic) else {
            return 0;
        };
        list.retain(|tx| tx.send(payload.to_vec()).is_ok());
        list.len()
    }

    /// Drop every subscriber, ending their streams.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, Vec<mpsc::UnboundedSender<Vec<u8>>>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(Topic::Update.as_str(), "update");
        assert_eq!(Topic::Awareness.to_string(), "awareness");
    }

    #[tokio::test]
    async fn test_router_dispatches_by_topic() {
        let router = TopicRouter::default();
        let mut updates = router.subscribe(Topic::Update);
        let mut awareness = router.subscribe(Topic::Awareness);

        assert_eq!(router.dispatch(Topic::Update, &[7]), 1);
        assert_eq!(updates.recv().await, Some(vec![7]));
        assert!(awareness.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_router_prunes_dropped_subscribers() {
        let router = TopicRouter::default();
        let rx = router.subscribe(Topic::Update);
        drop(rx);
        assert_eq!(router.dispatch(Topic::Update, &[1]), 0);
    }

    #[tokio::test]
    async fn test_router_clear_ends_streams() {
        let router = TopicRouter::default();
        let mut rx = router.subscribe(Topic::Awareness);
        router.clear();
        assert_eq!(rx.recv().await, None);
    }
}
