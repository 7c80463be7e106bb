//! WebSocket client side of the relay.
//!
//! Every channel owns one connection. The channel turns ready when the relay
//! answers `Join` with `Joined`; when the connection drops it stays not
//! ready. There is no reconnect and no outbox.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::{BroadcastTransport, Channel, Topic, TopicRouter, TransportError};
use crate::protocol::{FrameType, RelayFrame};

/// [`BroadcastTransport`] backed by a [`RelayServer`](crate::relay::RelayServer).
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    /// `url` is the relay's WebSocket URL, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl BroadcastTransport for WsTransport {
    fn open(&self, name: &str) -> Result<Arc<dyn Channel>, TransportError> {
        let (ready, _) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let state = Arc::new(WsState {
            name: name.to_string(),
            member_id: Uuid::new_v4(),
            router: TopicRouter::default(),
            ready,
            shutdown,
            outgoing,
        });

        tokio::spawn(run_connection(
            state.clone(),
            self.url.clone(),
            outgoing_rx,
            shutdown_rx,
        ));

        Ok(Arc::new(WsChannel { state }))
    }
}

struct WsState {
    name: String,
    member_id: Uuid,
    router: TopicRouter,
    ready: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

async fn run_connection(
    state: Arc<WsState>,
    url: String,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let connect = tokio::select! {
        res = tokio_tungstenite::connect_async(url.as_str()) => res,
        _ = shutdown.changed() => {
            state.router.clear();
            return;
        }
    };
    let ws_stream = match connect {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Relay connection to {url} failed for {}: {e}", state.name);
            state.router.clear();
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    match RelayFrame::join(state.member_id, state.name.as_str()).encode() {
        Ok(join) => {
            if let Err(e) = ws_sender.send(Message::Binary(join.into())).await {
                warn!("Failed to send join for {}: {e}", state.name);
                state.router.clear();
                return;
            }
        }
        Err(e) => {
            warn!("Failed to encode join for {}: {e}", state.name);
            state.router.clear();
            return;
        }
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let frame = match RelayFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Dropping malformed relay frame on {}: {e}", state.name);
                            continue;
                        }
                    };
                    match frame.frame_type {
                        FrameType::Joined => {
                            state.ready.send_replace(true);
                            info!("Channel {} joined relay", state.name);
                        }
                        FrameType::Publish => {
                            if frame.member_id == state.member_id {
                                continue;
                            }
                            match frame.require_topic() {
                                Ok(topic) => {
                                    state.router.dispatch(topic, &frame.payload);
                                }
                                Err(e) => warn!("Dropping relay frame on {}: {e}", state.name),
                            }
                        }
                        FrameType::Ping => {
                            if let Ok(pong) = RelayFrame::pong(state.member_id).encode() {
                                if ws_sender.send(Message::Binary(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        other => debug!("Ignoring {other:?} frame on {}", state.name),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if ws_sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Relay closed connection for {}", state.name);
                    break;
                }
                Some(Err(e)) => {
                    warn!("Relay connection error on {}: {e}", state.name);
                    break;
                }
                Some(Ok(_)) => {}
            },
            out = outgoing.recv() => match out {
                Some(bytes) => {
                    if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                        warn!("Relay send failed on {}: {e}", state.name);
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                if let Ok(leave) = RelayFrame::leave(state.member_id, state.name.as_str()).encode() {
                    // Flush what was queued before close, then leave.
                    while let Ok(bytes) = outgoing.try_recv() {
                        let _ = ws_sender.send(Message::Binary(bytes.into())).await;
                    }
                    let _ = ws_sender.send(Message::Binary(leave.into())).await;
                }
                let _ = ws_sender.close().await;
                break;
            }
        }
    }

    state.ready.send_replace(false);
    state.router.clear();
    debug!("Relay channel {} finished", state.name);
}

struct WsChannel {
    state: Arc<WsState>,
}

impl Channel for WsChannel {
    fn name(&self) -> &str {
        &self.state.name
    }

    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), TransportError> {
        if *self.state.shutdown.borrow() {
            return Err(TransportError::Closed(self.state.name.clone()));
        }
        if !*self.state.ready.borrow() {
            return Err(TransportError::NotReady(self.state.name.clone()));
        }
        let frame = RelayFrame::publish(self.state.member_id, self.state.name.as_str(), topic, payload);
        self.state
            .outgoing
            .send(frame.encode()?)
            .map_err(|_| TransportError::Closed(self.state.name.clone()))
    }

    fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<Vec<u8>> {
        self.state.router.subscribe(topic)
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.state.ready.subscribe()
    }

    fn close(&self) {
        self.state.shutdown.send_replace(true);
        self.state.ready.send_replace(false);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}
