//! WebSocket sync client implementing [`Transport`].
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, maintain)
//! - Request/reply correlation with per-request timeouts
//! - Demultiplexing of pushes to `topic/<id>` channel listeners
//!
//! There is no offline queue: requests made while disconnected fail with
//! [`TransportError::ConnectionClosed`] and are not replayed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::protocol::{MessageType, SyncMessage};
use crate::transport::{
    ChannelListener, ChannelRegistry, ConnectionEvent, ListenerId, Transport, TransportError,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a request waits for its reply
    pub request_timeout: Duration,
    /// Outgoing frames buffered for the writer task
    pub channel_capacity: usize,
    /// Pause between reconnect attempts in `maintain`
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Outgoing half of one live connection.
struct Link {
    epoch: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>>;

/// The sync client.
pub struct SyncClient {
    peer_id: Uuid,
    topic: String,
    server_url: String,
    config: ClientConfig,
    state: Arc<RwLock<ConnectionState>>,
    link: Arc<Mutex<Option<Link>>>,
    epochs: AtomicU64,
    pending: PendingReplies,
    next_request: AtomicU64,
    registry: Arc<ChannelRegistry>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
}

impl SyncClient {
    /// Create a new client for `topic`. Does not connect.
    pub fn new(topic: impl Into<String>, server_url: impl Into<String>, config: ClientConfig) -> Self {
        let topic = topic.into();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_id: Uuid::new_v4(),
            registry: Arc::new(ChannelRegistry::new(topic.clone())),
            topic,
            server_url: server_url.into(),
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            link: Arc::new(Mutex::new(None)),
            epochs: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(0),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    /// Take the connection event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.lock().take()
    }

    /// Connect to the server and subscribe to the topic.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), TransportError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::debug!("Failed to connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(TransportError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Outgoing message channel
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.channel_capacity.max(1));
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        *self.link.lock() = Some(Link { epoch, tx: out_tx });

        // Writer task: forward outgoing channel to WebSocket; closes the
        // socket once the link is dropped.
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route replies and pushes
        {
            let pending = self.pending.clone();
            let registry = self.registry.clone();
            let link = self.link.clone();
            let state = self.state.clone();
            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(msg) = ws_reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let bytes: Vec<u8> = data.into();
                            match SyncMessage::decode(&bytes) {
                                Ok(message) => Self::dispatch(&pending, &registry, message),
                                Err(e) => log::warn!("Failed to decode server message: {e}"),
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }

                // Connection lost
                let current = {
                    let mut link = link.lock();
                    let current = link.as_ref().is_some_and(|l| l.epoch == epoch);
                    if current {
                        *link = None;
                    }
                    current
                };
                if current {
                    // Dropping the reply senders fails every waiting request.
                    pending.lock().clear();
                    *state.write().await = ConnectionState::Disconnected;
                    let _ = event_tx.try_send(ConnectionEvent::Disconnected);
                    log::info!("Disconnected from server");
                }
            });
        }

        let subscribe = SyncMessage::subscribe(self.peer_id, 0, self.topic.as_str());
        if let Err(e) = self.request(subscribe).await {
            self.disconnect().await;
            return Err(e);
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.try_send(ConnectionEvent::Connected);
        log::info!("Connected to {} as {} on topic {}", self.server_url, self.peer_id, self.topic);
        Ok(())
    }

    /// Close the current connection, if any.
    pub async fn disconnect(&self) {
        let dropped = self.link.lock().take();
        if dropped.is_some() {
            self.pending.lock().clear();
            *self.state.write().await = ConnectionState::Disconnected;
            let _ = self.event_tx.try_send(ConnectionEvent::Disconnected);
        }
    }

    /// Keep the client connected until `cancel` fires, retrying every
    /// [`ClientConfig::reconnect_delay`].
    pub fn maintain(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                if self.connection_state().await == ConnectionState::Disconnected {
                    match self.connect().await {
                        Ok(()) => log::debug!("Connection to {} restored", self.server_url),
                        Err(e) => log::debug!("Reconnect to {} failed: {e}", self.server_url),
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                }
            }
            self.disconnect().await;
        })
    }

    /// Round-trip a ping through the server.
    pub async fn ping(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        self.request(SyncMessage::ping(self.peer_id)).await?;
        Ok(started.elapsed())
    }

    /// Send a request and wait for the matching reply.
    async fn request(&self, mut message: SyncMessage) -> Result<SyncMessage, TransportError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        message.request_id = request_id;
        let encoded = message.encode()?;

        let tx = self
            .link
            .lock()
            .as_ref()
            .map(|link| link.tx.clone())
            .ok_or(TransportError::ConnectionClosed)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, reply_tx);

        if tx.send(encoded).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::ConnectionClosed);
        }

        let reply = match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                log::warn!("Request {request_id} ({:?}) timed out", message.msg_type);
                return Err(TransportError::Timeout);
            }
        };

        match reply.msg_type {
            MessageType::Error => Err(TransportError::Remote(reply.error_message()?)),
            _ => Ok(reply),
        }
    }

    fn dispatch(pending: &PendingReplies, registry: &ChannelRegistry, message: SyncMessage) {
        match message.msg_type {
            MessageType::Reply | MessageType::Error | MessageType::Pong => {
                match pending.lock().remove(&message.request_id) {
                    Some(tx) => {
                        let _ = tx.send(message);
                    }
                    None => log::debug!("Reply to unknown request {}", message.request_id),
                }
            }
            MessageType::PushUpdate | MessageType::PushRemove => match message.into_push() {
                Ok(push) => {
                    registry.dispatch(push);
                }
                Err(e) => log::warn!("Malformed push: {e}"),
            },
            other => log::debug!("Unhandled message type: {other:?}"),
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Transport for SyncClient {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&self, id: &str) -> Result<Option<Value>, TransportError> {
        let request = SyncMessage::read(self.peer_id, 0, self.topic.as_str(), id);
        Ok(self.request(request).await?.value()?)
    }

    async fn update(&self, id: &str, value: Value) -> Result<(), TransportError> {
        let request = SyncMessage::update(self.peer_id, 0, self.topic.as_str(), id, &value);
        self.request(request).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), TransportError> {
        let request = SyncMessage::remove(self.peer_id, 0, self.topic.as_str(), id);
        self.request(request).await.map(|_| ())
    }

    fn listen(&self, id: &str, listener: ChannelListener) -> ListenerId {
        self.registry.listen(id, listener)
    }

    fn unlisten(&self, id: &str, listener: ListenerId) -> bool {
        self.registry.unlisten(id, listener)
    }
}
