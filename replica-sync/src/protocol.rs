//! Binary protocol for the WebSocket transport.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬────────────┬─────────┬─────────┬──────────┐
//! │ msg_type │ peer_id  │ request_id │ topic   │ id      │ payload  │
//! │ 1 byte   │ 16 bytes │ varint     │ string  │ string  │ variable │
//! └──────────┴──────────┴────────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! Values are schema-less, so the payload carries the value as JSON bytes.
//! An empty payload means "no value". `Error` payloads are UTF-8 text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::{Push, PushAction};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Bind the connection to a topic
    Subscribe = 1,
    /// Fetch a value or the directory record
    Read = 2,
    /// Push a new value
    Update = 3,
    /// Announce a value is no longer live
    Remove = 4,
    /// Successful response to a request
    Reply = 5,
    /// A value changed on the server
    PushUpdate = 6,
    /// A value was removed on the server
    PushRemove = 7,
    /// Failed response to a request
    Error = 8,
    /// Heartbeat ping
    Ping = 9,
    /// Heartbeat pong
    Pong = 10,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender for requests; original writer for pushes.
    pub peer_id: Uuid,
    /// Correlates a `Reply`/`Error` with its request. Zero for pushes.
    pub request_id: u64,
    pub topic: String,
    pub id: String,
    pub payload: Vec<u8>,
}

fn value_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, request_id: u64) -> Self {
        Self {
            msg_type,
            peer_id,
            request_id,
            topic: String::new(),
            id: String::new(),
            payload: Vec::new(),
        }
    }

    fn addressed(mut self, topic: impl Into<String>, id: impl Into<String>) -> Self {
        self.topic = topic.into();
        self.id = id.into();
        self
    }

    pub fn subscribe(peer_id: Uuid, request_id: u64, topic: impl Into<String>) -> Self {
        Self::new(MessageType::Subscribe, peer_id, request_id).addressed(topic, "")
    }

    pub fn read(peer_id: Uuid, request_id: u64, topic: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(MessageType::Read, peer_id, request_id).addressed(topic, id)
    }

    pub fn update(
        peer_id: Uuid,
        request_id: u64,
        topic: impl Into<String>,
        id: impl Into<String>,
        value: &Value,
    ) -> Self {
        let mut msg = Self::new(MessageType::Update, peer_id, request_id).addressed(topic, id);
        msg.payload = value_bytes(value);
        msg
    }

    pub fn remove(peer_id: Uuid, request_id: u64, topic: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(MessageType::Remove, peer_id, request_id).addressed(topic, id)
    }

    /// Successful response; `value` is the result of a read, if any.
    pub fn reply(peer_id: Uuid, request_id: u64, value: Option<&Value>) -> Self {
        let mut msg = Self::new(MessageType::Reply, peer_id, request_id);
        if let Some(value) = value {
            msg.payload = value_bytes(value);
        }
        msg
    }

    pub fn error(peer_id: Uuid, request_id: u64, message: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Error, peer_id, request_id);
        msg.payload = message.into().into_bytes();
        msg
    }

    pub fn push_update(
        writer: Uuid,
        topic: impl Into<String>,
        id: impl Into<String>,
        value: &Value,
    ) -> Self {
        let mut msg = Self::new(MessageType::PushUpdate, writer, 0).addressed(topic, id);
        msg.payload = value_bytes(value);
        msg
    }

    pub fn push_remove(writer: Uuid, topic: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(MessageType::PushRemove, writer, 0).addressed(topic, id)
    }

    /// Wrap a hub push for the wire.
    pub fn from_push(writer: Uuid, topic: impl Into<String>, push: &Push) -> Self {
        match &push.action {
            PushAction::Update(value) => {
                Self::push_update(writer, topic, push.id.clone(), value)
            }
            PushAction::Remove => {
                Self::push_remove(writer, topic, push.id.clone())
            }
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, 0)
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, 0)
    }

    /// Whether this message expects a `Reply` or `Error`.
    pub fn is_request(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::Subscribe | MessageType::Read | MessageType::Update | MessageType::Remove
        )
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON payload. `None` when the payload is empty.
    pub fn value(&self) -> Result<Option<Value>, ProtocolError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.payload)
            .map(Some)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Text of an `Error` message.
    pub fn error_message(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Error {
            return Err(ProtocolError::InvalidMessageType);
        }
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    /// Turn a `PushUpdate`/`PushRemove` into a channel push.
    pub fn into_push(self) -> Result<Push, ProtocolError> {
        match self.msg_type {
            MessageType::PushUpdate => {
                let value = self
                    .value()?
                    .ok_or_else(|| ProtocolError::Deserialization("empty push payload".into()))?;
                Ok(Push::update(self.id, value))
            }
            MessageType::PushRemove => Ok(Push::remove(self.id)),
            _ => Err(ProtocolError::InvalidMessageType),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid message type")]
    InvalidMessageType,
}
