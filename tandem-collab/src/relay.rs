//! WebSocket relay: the server side of [`WsTransport`](crate::transport::WsTransport).
//!
//! ```text
//! Client A ──┐                         ┌──► Client B
//!            ├── Join "doc-<id>" ──► ChannelGroup ──┤
//! Client C ──┘   Publish(topic)        └──► Client C
//! ```
//!
//! The relay holds no document state. Each connection joins one channel;
//! every `Publish` is fanned out to the channel's other members and nothing
//! is stored or replayed.

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{ChannelGroup, ChannelRegistry, Envelope};
use crate::protocol::{FrameType, RelayFrame};

pub const ENV_ADDR: &str = "TANDEM_RELAY_ADDR";
pub const ENV_CAPACITY: &str = "TANDEM_RELAY_CAPACITY";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Envelopes buffered per member before a slow member lags.
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            channel_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            channel_capacity: 64,
        }
    }

    /// Defaults overridden by `TANDEM_RELAY_ADDR` and
    /// `TANDEM_RELAY_CAPACITY`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup(ENV_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup(ENV_CAPACITY) {
            match raw.parse::<usize>() {
                Ok(capacity) if capacity > 0 => config.channel_capacity = capacity,
                _ => warn!("Ignoring invalid {ENV_CAPACITY}={raw}"),
            }
        }
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub bytes_relayed: u64,
    pub malformed_frames: u64,
    pub active_channels: usize,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<ChannelRegistry>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(ChannelRegistry::new(config.channel_capacity));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry, stats).await {
                    warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ChannelRegistry>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), RelayError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut membership: Option<(Uuid, Arc<ChannelGroup>)> = None;
    let mut group_rx: Option<broadcast::Receiver<Envelope>> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let frame = match RelayFrame::decode(&data) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Malformed frame from {addr}: {e}");
                            stats.write().await.malformed_frames += 1;
                            continue;
                        }
                    };

                    match frame.frame_type {
                        FrameType::Join => {
                            if membership.is_some() {
                                warn!("{addr} tried to join a second channel");
                                continue;
                            }
                            let group = registry.get_or_create(&frame.channel).await;
                            group_rx = Some(group.join(frame.member_id).await);
                            membership = Some((frame.member_id, group));

                            let joined = match RelayFrame::joined(frame.member_id, frame.channel.as_str()).encode() {
                                Ok(joined) => joined,
                                Err(e) => {
                                    warn!("Could not encode Joined for {addr}: {e}");
                                    break;
                                }
                            };
                            if ws_sender.send(Message::Binary(joined.into())).await.is_err() {
                                break;
                            }
                            stats.write().await.active_channels = registry.channel_count().await;
                            info!("Member {} joined {} from {addr}", frame.member_id, frame.channel);
                        }
                        FrameType::Publish => {
                            let Some((member, group)) = membership.as_ref() else {
                                warn!("{addr} published before joining");
                                continue;
                            };
                            if frame.channel != group.name() {
                                warn!("{addr} published to {} while joined to {}", frame.channel, group.name());
                                continue;
                            }
                            let topic = match frame.require_topic() {
                                Ok(topic) => topic,
                                Err(e) => {
                                    warn!("Dropping frame from {addr}: {e}");
                                    stats.write().await.malformed_frames += 1;
                                    continue;
                                }
                            };
                            let size = frame.payload.len() as u64;
                            group.publish(Envelope {
                                sender: *member,
                                topic,
                                payload: Arc::from(frame.payload),
                            });
                            let mut s = stats.write().await;
                            s.frames_relayed += 1;
                            s.bytes_relayed += size;
                        }
                        FrameType::Leave => {
                            debug!("{addr} left {}", frame.channel);
                            break;
                        }
                        FrameType::Ping => {
                            let member = membership.as_ref().map_or(Uuid::nil(), |(id, _)| *id);
                            if let Ok(pong) = RelayFrame::pong(member).encode() {
                                if ws_sender.send(Message::Binary(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        FrameType::Pong => {}
                        FrameType::Joined => warn!("Unexpected Joined frame from {addr}"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if ws_sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Connection closed from {addr}");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from {addr}: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            },

            envelope = async {
                match group_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => match envelope {
                Ok(envelope) => {
                    let Some((member, group)) = membership.as_ref() else {
                        continue;
                    };
                    if envelope.sender == *member {
                        continue;
                    }
                    let frame = RelayFrame::publish(
                        envelope.sender,
                        group.name(),
                        envelope.topic,
                        envelope.payload.to_vec(),
                    );
                    match frame.encode() {
                        Ok(bytes) => {
                            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Could not encode relay frame for {addr}: {e}"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{addr} lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Some((member, group)) = membership {
        group.leave(&member).await;
        if registry.remove_if_empty(group.name()).await {
            debug!("Channel {} removed (empty)", group.name());
        }
    }

    let mut s = stats.write().await;
    s.active_connections = s.active_connections.saturating_sub(1);
    s.active_channels = registry.channel_count().await;
    Ok(())
}
