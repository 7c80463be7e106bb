//! Binary frames exchanged between [`WsTransport`](crate::transport::WsTransport)
//! and [`RelayServer`](crate::relay::RelayServer).
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌────────────┬───────────┬──────────┬──────────┬──────────┐
//! │ frame_type │ member_id │ channel  │ topic    │ payload  │
//! │ 1 byte     │ 16 bytes  │ string   │ optional │ variable │
//! └────────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! A connection joins exactly one channel. `Joined` is the relay's
//! acknowledgment and marks the client side ready.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Client asks to join `channel`.
    Join = 1,
    /// Relay acknowledges the join.
    Joined = 2,
    /// Payload on a topic, fanned out to the other members.
    Publish = 3,
    /// Client leaves its channel.
    Leave = 4,
    Ping = 5,
    Pong = 6,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayFrame {
    pub frame_type: FrameType,
    pub member_id: Uuid,
    pub channel: String,
    pub topic: Option<Topic>,
    pub payload: Vec<u8>,
}

impl RelayFrame {
    fn bare(frame_type: FrameType, member_id: Uuid, channel: impl Into<String>) -> Self {
        Self {
            frame_type,
            member_id,
            channel: channel.into(),
            topic: None,
            payload: Vec::new(),
        }
    }

    pub fn join(member_id: Uuid, channel: impl Into<String>) -> Self {
        Self::bare(FrameType::Join, member_id, channel)
    }

    pub fn joined(member_id: Uuid, channel: impl Into<String>) -> Self {
        Self::bare(FrameType::Joined, member_id, channel)
    }

    pub fn publish(
        member_id: Uuid,
        channel: impl Into<String>,
        topic: Topic,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            frame_type: FrameType::Publish,
            member_id,
            channel: channel.into(),
            topic: Some(topic),
            payload,
        }
    }

    pub fn leave(member_id: Uuid, channel: impl Into<String>) -> Self {
        Self::bare(FrameType::Leave, member_id, channel)
    }

    pub fn ping(member_id: Uuid) -> Self {
        Self::bare(FrameType::Ping, member_id, String::new())
    }

    pub fn pong(member_id: Uuid) -> Self {
        Self::bare(FrameType::Pong, member_id, String::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }

    /// Topic of a `Publish` frame.
    pub fn require_topic(&self) -> Result<Topic, ProtocolError> {
        match (self.frame_type, self.topic) {
            (FrameType::Publish, Some(topic)) => Ok(topic),
            (FrameType::Publish, None) => Err(ProtocolError::MissingTopic),
            _ => Err(ProtocolError::UnexpectedFrame(self.frame_type)),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("frame decoding failed: {0}")]
    Decode(String),
    #[error("publish frame without a topic")]
    MissingTopic,
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
}
