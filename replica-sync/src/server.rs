//! WebSocket sync server with topic-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── TopicRoom (topic) ── ObservableStore ── broadcast
//! Client B ──┘                                               │
//!                                            ┌───────────────┼───────────┐
//!                                            ▼               ▼           ▼
//!                                         Client A        Client B    Client C
//! ```
//!
//! A connection binds itself to one topic with `Subscribe`. After that it
//! may issue `Read`, `Update` and `Remove` requests, each answered by a
//! `Reply` or an `Error` carrying the request id. Committed changes of the
//! topic are pushed to every connection except the one that wrote them.
//!
//! A connection whose push receiver lags is closed; the client reconnects
//! and resynchronizes from the directory record.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::hub::{Hub, HubConfig, HubEvent};
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Debounce window for value writes, in milliseconds (0 = off)
    pub debounce_ms: u64,
    /// Grace period before a departed peer's ids are reaped (None = never)
    pub orphan_grace_secs: Option<u64>,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            debounce_ms: 0,
            orphan_grace_secs: Some(30),
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            broadcast_capacity: self.broadcast_capacity,
            orphan_grace: self.orphan_grace_secs.map(Duration::from_secs),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_topics: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<Hub>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(Hub::new(config.hub_config()));
        Self {
            config,
            hub,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<(Uuid, String)> = None;
        let result = Self::run_session(ws_stream, addr, &hub, &stats, &config, &mut session).await;

        // Cleanup: release the peer's hold on its topic
        if let Some((peer_id, topic)) = session {
            hub.release(peer_id, &topic);
            log::info!("Peer {peer_id} left topic {topic}");
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_topics = hub.topic_count();
        }

        result
    }

    async fn run_session(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        hub: &Hub,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        session: &mut Option<(Uuid, String)>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut push_rx: Option<broadcast::Receiver<HubEvent>> = None;

        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        // First tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let request = match SyncMessage::decode(&bytes) {
                                Ok(request) => request,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            if request.msg_type == MessageType::Subscribe {
                                if let Some((peer_id, topic)) = session.take() {
                                    hub.release(peer_id, &topic);
                                }
                                push_rx = Some(hub.subscribe(request.peer_id, &request.topic));
                                *session = Some((request.peer_id, request.topic.clone()));
                                stats.write().await.active_topics = hub.topic_count();
                                log::info!("Peer {} joined topic {}", request.peer_id, request.topic);
                            }

                            if let Some(response) = Self::handle_request(hub, session.as_ref(), &request) {
                                let encoded = response.encode()?;
                                ws_sender.send(Message::Binary(encoded.into())).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing push
                event = async {
                    match push_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not subscribed yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Ok(event) => {
                            let Some((peer_id, topic)) = session.as_ref() else {
                                continue;
                            };
                            // Don't echo back to the writer
                            if event.origin == Some(*peer_id) {
                                continue;
                            }
                            let writer = event.origin.unwrap_or_else(Uuid::nil);
                            let push = SyncMessage::from_push(writer, topic.as_str(), &event.push);
                            ws_sender.send(Message::Binary(push.encode()?.into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer at {addr} lagged by {n} pushes; closing so it resynchronizes");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Answer one request. Returns `None` for messages that need no reply.
    pub fn handle_request(
        hub: &Hub,
        session: Option<&(Uuid, String)>,
        request: &SyncMessage,
    ) -> Option<SyncMessage> {
        let server = Uuid::nil();
        let request_id = request.request_id;

        match request.msg_type {
            MessageType::Subscribe => Some(SyncMessage::reply(server, request_id, None)),

            MessageType::Read | MessageType::Update | MessageType::Remove => {
                let Some((peer_id, topic)) = session else {
                    return Some(SyncMessage::error(server, request_id, "not subscribed"));
                };
                if request.topic != *topic {
                    return Some(SyncMessage::error(
                        server,
                        request_id,
                        format!("subscribed to {topic}, not {}", request.topic),
                    ));
                }

                let response = match request.msg_type {
                    MessageType::Read => {
                        let value = hub.read(topic, &request.id);
                        SyncMessage::reply(server, request_id, value.as_ref())
                    }
                    MessageType::Update => match request.value() {
                        Ok(Some(value)) => {
                            hub.update(*peer_id, topic, &request.id, value);
                            SyncMessage::reply(server, request_id, None)
                        }
                        Ok(None) => SyncMessage::error(server, request_id, "update without a value"),
                        Err(e) => SyncMessage::error(server, request_id, e.to_string()),
                    },
                    _ => {
                        hub.remove(*peer_id, topic, &request.id);
                        SyncMessage::reply(server, request_id, None)
                    }
                };
                Some(response)
            }

            MessageType::Ping => {
                let mut pong = SyncMessage::pong(server);
                pong.request_id = request_id;
                Some(pong)
            }

            other => {
                log::debug!("Unhandled message type: {other:?}");
                None
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Shared topic state.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscribed(topic: &str) -> (Hub, (Uuid, String)) {
        (Hub::default(), (Uuid::new_v4(), topic.to_string()))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.debounce_ms, 0);
        assert_eq!(config.orphan_grace_secs, Some(30));
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_hub_config_mapping() {
        let config = ServerConfig {
            debounce_ms: 50,
            orphan_grace_secs: None,
            broadcast_capacity: 8,
            ..ServerConfig::default()
        };
        let hub = config.hub_config();
        assert_eq!(hub.debounce, Duration::from_millis(50));
        assert_eq!(hub.orphan_grace, None);
        assert_eq!(hub.broadcast_capacity, 8);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_topics, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_request_before_subscribe_is_rejected() {
        let hub = Hub::default();
        let request = SyncMessage::read(Uuid::new_v4(), 4, "game", "x");
        let response = SyncServer::handle_request(&hub, None, &request).unwrap();
        assert_eq!(response.msg_type, MessageType::Error);
        assert_eq!(response.request_id, 4);
        assert_eq!(response.error_message().unwrap(), "not subscribed");
    }

    #[tokio::test]
    async fn test_update_then_read() {
        let (hub, session) = subscribed("game");
        let update = SyncMessage::update(session.0, 1, "game", "x", &json!([1, 2]));
        let reply = SyncServer::handle_request(&hub, Some(&session), &update).unwrap();
        assert_eq!(reply.msg_type, MessageType::Reply);
        assert_eq!(hub.room("game").owner("x"), Some(session.0));

        let read = SyncMessage::read(session.0, 2, "game", "x");
        let reply = SyncServer::handle_request(&hub, Some(&session), &read).unwrap();
        assert_eq!(reply.request_id, 2);
        assert_eq!(reply.value().unwrap(), Some(json!([1, 2])));

        let remove = SyncMessage::remove(session.0, 3, "game", "x");
        SyncServer::handle_request(&hub, Some(&session), &remove).unwrap();
        assert_eq!(hub.read("game", "x"), None);
    }

    #[test]
    fn test_topic_mismatch() {
        let (hub, session) = subscribed("game");
        let read = SyncMessage::read(session.0, 1, "other", "x");
        let reply = SyncServer::handle_request(&hub, Some(&session), &read).unwrap();
        assert_eq!(reply.msg_type, MessageType::Error);
    }

    #[test]
    fn test_ping_echoes_request_id() {
        let hub = Hub::default();
        let mut ping = SyncMessage::ping(Uuid::new_v4());
        ping.request_id = 9;
        let pong = SyncServer::handle_request(&hub, None, &ping).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.request_id, 9);

        let stray = SyncMessage::pong(Uuid::new_v4());
        assert!(SyncServer::handle_request(&hub, None, &stray).is_none());
    }
}
