//! Transport contract between a directory and the server.
//!
//! Outbound: three request/response calls (`read`, `update`, `remove`).
//! Inbound: one push channel per topic, multiplexed by per-value channel
//! names of the form `topic/<id>`.
//!
//! ```text
//!   Directory ──read/update/remove──► Transport ──► server
//!       ▲                                 │
//!       └──── listener(topic/<id>) ◄── ChannelRegistry ◄── pushes
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// What happened to a value on the server.
#[derive(Debug, Clone, PartialEq)]
pub enum PushAction {
    Update(Value),
    Remove,
}

/// One inbound message on a value's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub id: String,
    pub action: PushAction,
}

impl Push {
    pub fn update(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            action: PushAction::Update(value),
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: PushAction::Remove,
        }
    }
}

/// Connection lifecycle notifications emitted by networked transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Errors from individual transport requests. Never retried automatically.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
    #[error("server rejected request: {0}")]
    Remote(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type ChannelListener = Arc<dyn Fn(Push) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Channel name for a value within a topic.
pub fn channel_name(topic: &str, id: &str) -> String {
    format!("{topic}/{id}")
}

/// Push/pull access to one topic on a server.
pub trait Transport: Send + Sync + 'static {
    /// The topic this transport is connected to.
    fn topic(&self) -> &str;

    /// Fetch a value (or the directory record) by id.
    fn read(&self, id: &str) -> impl Future<Output = Result<Option<Value>, TransportError>> + Send;

    /// Push a new value for `id`.
    fn update(&self, id: &str, value: Value) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Announce that `id` is no longer live.
    fn remove(&self, id: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Attach a listener to the channel `topic/<id>`.
    fn listen(&self, id: &str, listener: ChannelListener) -> ListenerId;

    /// Detach a listener. Returns `false` if it was not attached.
    fn unlisten(&self, id: &str, listener: ListenerId) -> bool;
}

/// Demultiplexes inbound pushes to per-channel listeners.
pub struct ChannelRegistry {
    topic: String,
    next_id: AtomicU64,
    channels: Mutex<HashMap<String, Vec<(ListenerId, ChannelListener)>>>,
}

impl ChannelRegistry {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            next_id: AtomicU64::new(0),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn listen(&self, id: &str, listener: ChannelListener) -> ListenerId {
        let listener_id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .lock()
            .entry(channel_name(&self.topic, id))
            .or_default()
            .push((listener_id, listener));
        listener_id
    }

    pub fn unlisten(&self, id: &str, listener: ListenerId) -> bool {
        let channel = channel_name(&self.topic, id);
        let mut channels = self.channels.lock();
        let Some(listeners) = channels.get_mut(&channel) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != listener);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            channels.remove(&channel);
        }
        removed
    }

    /// Deliver `push` to every listener on its channel. Returns how many
    /// listeners received it.
    pub fn dispatch(&self, push: Push) -> usize {
        let listeners: Vec<ChannelListener> = self
            .channels
            .lock()
            .get(&channel_name(&self.topic, &push.id))
            .map(|ls| ls.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();
        if listeners.is_empty() {
            log::trace!("No listener for {}/{}", self.topic, push.id);
        }
        for listener in &listeners {
            listener(push.clone());
        }
        listeners.len()
    }

    pub fn listener_count(&self, id: &str) -> usize {
        self.channels
            .lock()
            .get(&channel_name(&self.topic, id))
            .map_or(0, Vec::len)
    }

    /// Number of channels with at least one listener.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}
