//! Server-side topic state.
//!
//! ```text
//!   update/remove ──► TopicRoom ──► debounced store ──► broadcast ──► peers
//!                        │
//!                        └── owners ──► grace timer ──► reap orphaned ids
//! ```
//!
//! Every topic gets one room: an [`ObservableStore`] (optionally debounced)
//! holding the latest value of each id, and a broadcast channel fanning out
//! committed changes to every subscribed peer. Pushes carry the id of the
//! peer whose write produced them so that peer can skip its own echo.
//!
//! Ids beginning with the immortal prefix bypass the debounce window, so a
//! directory read-modify-write always sees committed state.
//!
//! The first peer to write a non-immortal id owns it. When a peer's last
//! connection to a topic closes and it has not come back within
//! [`HubConfig::orphan_grace`], every id it owns is removed from the store
//! and from the directory record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::envelope::{ids_from_value, ids_to_value, is_immortal, DIRECTORY_ID};
use crate::store::ObservableStore;
use crate::transport::{
    ChannelListener, ChannelRegistry, ConnectionEvent, ListenerId, Push, Transport, TransportError,
};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-id debounce window for non-immortal writes.
    pub debounce: Duration,
    /// Pushes buffered per subscriber before it starts lagging.
    pub broadcast_capacity: usize,
    /// How long a disconnected peer's ids survive. `None` never reaps.
    pub orphan_grace: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::ZERO,
            broadcast_capacity: 256,
            orphan_grace: Some(Duration::from_secs(30)),
        }
    }
}

/// A committed change, tagged with the peer that caused it.
#[derive(Debug, Clone)]
pub struct HubEvent {
    /// `None` for changes made by the hub itself.
    pub origin: Option<Uuid>,
    pub push: Push,
}

#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub topics: usize,
    pub values: usize,
    pub peers: usize,
    pub pushes_sent: u64,
    pub ids_reaped: u64,
}

struct Presence {
    connections: usize,
    /// Bumped on every subscribe; a grace timer only reaps if it still matches.
    epoch: u64,
}

/// State for one topic.
pub struct TopicRoom {
    topic: String,
    store: ObservableStore<Value>,
    sender: broadcast::Sender<HubEvent>,
    /// Last writer of each id, read when the write commits.
    writers: Arc<Mutex<HashMap<String, Uuid>>>,
    owners: Mutex<HashMap<String, Uuid>>,
    peers: Mutex<HashMap<Uuid, Presence>>,
    pushes_sent: Arc<AtomicU64>,
    ids_reaped: AtomicU64,
}

impl TopicRoom {
    fn new(topic: String, config: &HubConfig) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let store = ObservableStore::<Value>::with_debounce(config.debounce);
        let writers: Arc<Mutex<HashMap<String, Uuid>>> = Arc::new(Mutex::new(HashMap::new()));
        let pushes_sent = Arc::new(AtomicU64::new(0));

        {
            let (sender, writers, sent) = (sender.clone(), writers.clone(), pushes_sent.clone());
            store.on_change(move |id, value| {
                let origin = writers.lock().get(id).copied();
                let _ = sender.send(HubEvent {
                    origin,
                    push: Push::update(id, value.clone()),
                });
                sent.fetch_add(1, Ordering::Relaxed);
            });
        }
        {
            let (sender, writers, sent) = (sender.clone(), writers.clone(), pushes_sent.clone());
            store.on_key_removed(move |id, _| {
                let origin = writers.lock().remove(id);
                let _ = sender.send(HubEvent {
                    origin,
                    push: Push::remove(id),
                });
                sent.fetch_add(1, Ordering::Relaxed);
            });
        }

        Self {
            topic,
            store,
            sender,
            writers,
            owners: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            pushes_sent,
            ids_reaped: AtomicU64::new(0),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn read(&self, id: &str) -> Option<Value> {
        self.store.get_value(id)
    }

    pub fn update(&self, peer: Uuid, id: &str, value: Value) {
        if value.is_null() {
            return self.remove(peer, id);
        }
        self.writers.lock().insert(id.to_string(), peer);
        if is_immortal(id) {
            self.store.set_value_now(id, value);
        } else {
            self.owners.lock().entry(id.to_string()).or_insert(peer);
            self.store.set_value(id, value);
        }
    }

    pub fn remove(&self, peer: Uuid, id: &str) {
        self.writers.lock().insert(id.to_string(), peer);
        if is_immortal(id) {
            self.store.set_value_now(id, None::<Value>);
        } else {
            self.owners.lock().remove(id);
            self.store.set_value(id, None::<Value>);
        }
    }

    pub fn subscribe(&self, peer: Uuid) -> broadcast::Receiver<HubEvent> {
        let mut peers = self.peers.lock();
        let presence = peers.entry(peer).or_insert(Presence {
            connections: 0,
            epoch: 0,
        });
        presence.connections += 1;
        presence.epoch += 1;
        self.sender.subscribe()
    }

    /// Drop one connection of `peer`. Returns the epoch to reap against once
    /// the peer has no connections left.
    fn release(&self, peer: Uuid) -> Option<u64> {
        let mut peers = self.peers.lock();
        let presence = peers.get_mut(&peer)?;
        presence.connections = presence.connections.saturating_sub(1);
        (presence.connections == 0).then_some(presence.epoch)
    }

    /// Remove every id owned by `peer` if it has not reconnected since
    /// `epoch`. Returns the number of ids reaped.
    pub fn reap_if_gone(&self, peer: Uuid, epoch: u64) -> usize {
        {
            let mut peers = self.peers.lock();
            match peers.get(&peer) {
                Some(p) if p.connections == 0 && p.epoch == epoch => {
                    peers.remove(&peer);
                }
                _ => return 0,
            }
        }

        let owned: Vec<String> = {
            let mut owners = self.owners.lock();
            let owned: Vec<String> = owners
                .iter()
                .filter(|(_, owner)| **owner == peer)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &owned {
                owners.remove(id);
            }
            owned
        };
        if owned.is_empty() {
            return 0;
        }

        for id in &owned {
            self.writers.lock().remove(id);
            self.store.set_value_now(id.clone(), None::<Value>);
        }

        if let Some(ids) = self.store.get_value(DIRECTORY_ID).as_ref().and_then(ids_from_value) {
            let kept: Vec<String> = ids.iter().filter(|id| !owned.contains(*id)).cloned().collect();
            if kept.len() != ids.len() {
                self.writers.lock().remove(DIRECTORY_ID);
                self.store.set_value_now(DIRECTORY_ID, ids_to_value(&kept));
            }
        }

        self.ids_reaped.fetch_add(owned.len() as u64, Ordering::Relaxed);
        log::info!(
            "Reaped {} orphaned ids of peer {peer} in topic {}",
            owned.len(),
            self.topic
        );
        owned.len()
    }

    pub fn owner(&self, id: &str) -> Option<Uuid> {
        self.owners.lock().get(id).copied()
    }

    pub fn value_count(&self) -> usize {
        self.store.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Commit every debounced write now.
    pub fn flush(&self) {
        self.store.flush();
    }
}

/// Maps topics to rooms.
pub struct Hub {
    config: HubConfig,
    rooms: RwLock<HashMap<String, Arc<TopicRoom>>>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get or create the room for `topic`.
    pub fn room(&self, topic: &str) -> Arc<TopicRoom> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().get(topic) {
            return room.clone();
        }

        let mut rooms = self.rooms.write();
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(topic) {
            return room.clone();
        }
        log::debug!("Creating room for topic {topic}");
        let room = Arc::new(TopicRoom::new(topic.to_string(), &self.config));
        rooms.insert(topic.to_string(), room.clone());
        room
    }

    pub fn read(&self, topic: &str, id: &str) -> Option<Value> {
        self.room(topic).read(id)
    }

    pub fn update(&self, peer: Uuid, topic: &str, id: &str, value: Value) {
        self.room(topic).update(peer, id, value);
    }

    pub fn remove(&self, peer: Uuid, topic: &str, id: &str) {
        self.room(topic).remove(peer, id);
    }

    pub fn subscribe(&self, peer: Uuid, topic: &str) -> broadcast::Receiver<HubEvent> {
        self.room(topic).subscribe(peer)
    }

    /// Called when one of `peer`'s connections to `topic` closes.
    pub fn release(&self, peer: Uuid, topic: &str) {
        let Some(room) = self.rooms.read().get(topic).cloned() else {
            return;
        };
        let Some(epoch) = room.release(peer) else {
            return;
        };
        let Some(grace) = self.config.orphan_grace else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log::debug!("Peer {peer} left topic {topic}; reaping in {grace:?}");
                runtime.spawn(async move {
                    tokio::time::sleep(grace).await;
                    room.reap_if_gone(peer, epoch);
                });
            }
            Err(_) => log::warn!("Peer {peer} left topic {topic} outside a runtime; not reaping"),
        }
    }

    pub fn topic_count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn stats(&self) -> HubStats {
        let rooms = self.rooms.read();
        let mut stats = HubStats {
            topics: rooms.len(),
            ..HubStats::default()
        };
        for room in rooms.values() {
            stats.values += room.value_count();
            stats.peers += room.peer_count();
            stats.pushes_sent += room.pushes_sent.load(Ordering::Relaxed);
            stats.ids_reaped += room.ids_reaped.load(Ordering::Relaxed);
        }
        stats
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// In-process [`Transport`] backed by a [`Hub`].
///
/// Can be switched offline to simulate a dropped connection: requests fail
/// with [`TransportError::ConnectionClosed`] and pushes are lost until it
/// comes back.
pub struct LocalTransport {
    hub: Arc<Hub>,
    topic: String,
    peer_id: Uuid,
    registry: Arc<ChannelRegistry>,
    online: Arc<AtomicBool>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    forwarder: JoinHandle<()>,
}

impl LocalTransport {
    /// Subscribe a new peer to `topic`. Must be called inside a runtime.
    pub fn connect(hub: &Arc<Hub>, topic: impl Into<String>) -> Arc<Self> {
        let topic = topic.into();
        let peer_id = Uuid::new_v4();
        let registry = Arc::new(ChannelRegistry::new(topic.clone()));
        let online = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(16);

        let mut rx = hub.subscribe(peer_id, &topic);
        let forwarder = {
            let (registry, online) = (registry.clone(), online.clone());
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if event.origin == Some(peer_id) || !online.load(Ordering::Acquire) {
                                continue;
                            }
                            registry.dispatch(event.push);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer_id} lagged, skipped {n} pushes");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Arc::new(Self {
            hub: hub.clone(),
            topic,
            peer_id,
            registry,
            online,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            forwarder,
        })
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::AcqRel) == online {
            return;
        }
        let event = if online {
            ConnectionEvent::Connected
        } else {
            ConnectionEvent::Disconnected
        };
        if self.event_tx.try_send(event).is_err() {
            log::debug!("Connection event {event:?} dropped; nobody listening");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Take the connection event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.lock().take()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    fn check_online(&self) -> Result<(), TransportError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }
}

impl Transport for LocalTransport {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn read(&self, id: &str) -> Result<Option<Value>, TransportError> {
        self.check_online()?;
        Ok(self.hub.read(&self.topic, id))
    }

    async fn update(&self, id: &str, value: Value) -> Result<(), TransportError> {
        self.check_online()?;
        self.hub.update(self.peer_id, &self.topic, id, value);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), TransportError> {
        self.check_online()?;
        self.hub.remove(self.peer_id, &self.topic, id);
        Ok(())
    }

    fn listen(&self, id: &str, listener: ChannelListener) -> ListenerId {
        self.registry.listen(id, listener)
    }

    fn unlisten(&self, id: &str, listener: ListenerId) -> bool {
        self.registry.unlisten(id, listener)
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.forwarder.abort();
        self.hub.release(self.peer_id, &self.topic);
    }
}
