//! Dynamic named values multiplexed over one transport connection.
//!
//! ```text
//!              create / set                      push (topic/<id>)
//!                  │                                   │
//!                  ▼                                   ▼
//!   ObservableStore<Envelope> ◄── Passive ─── Scheduler ◄── ChannelRegistry
//!        │ Active                    ▲
//!        ▼                           │
//!     Scheduler ── update/remove ──► Transport ── read (pull) ──┘
//! ```
//!
//! The set of live ids is itself a value: the immortal [`DIRECTORY_ID`]
//! record holds an array of ids. Every change to it reconciles local
//! bindings: new ids are bound and pulled, missing ones are torn down with
//! the poison pill. Mutations of the record are read-modify-write steps on
//! the directory's scheduler, so concurrent `add`/`remove` calls never lose
//! each other's update.
//!
//! Failed requests are logged and not retried; only
//! [`Directory::ensure_all_observable_ids`] loops.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::envelope::{
    ids_from_value, ids_to_value, is_immortal, is_poison_pill, poison_pill, Envelope,
    DIRECTORY_ID,
};
use crate::scheduler::Scheduler;
use crate::store::ObservableStore;
use crate::transport::{ConnectionEvent, ListenerId, Push, PushAction, Transport};

/// Bound values by id, excluding the directory record.
pub type Snapshot = BTreeMap<String, Value>;

pub type ObserverCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Delay between attempts of `ensure_all_observable_ids`.
    pub retry_delay: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("directory sync cancelled")]
    Cancelled,
}

/// Client-side engine for one topic.
pub struct Directory<T: Transport> {
    weak: Weak<Self>,
    transport: Arc<T>,
    config: DirectoryConfig,
    store: ObservableStore<Envelope<Value>>,
    scheduler: Scheduler,
    bindings: Mutex<HashMap<String, ListenerId>>,
    /// Ids whose announcement is still queued; reconciliation leaves them alone.
    pending_adds: Mutex<HashSet<String>>,
    observers: Mutex<HashMap<String, Vec<(ObserverId, ObserverCallback)>>>,
    next_observer: AtomicU64,
    /// Set while `publish_directory` writes the record; it pushes inline.
    announcing: AtomicBool,
}

impl<T: Transport> Directory<T> {
    /// Create a directory over `transport` and bind the directory record.
    /// Must be called inside a tokio runtime.
    pub fn new(transport: Arc<T>, config: DirectoryConfig) -> Arc<Self> {
        let scheduler = Scheduler::new(format!("directory:{}", transport.topic()));
        let directory = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            transport,
            config,
            store: ObservableStore::new(),
            scheduler,
            bindings: Mutex::new(HashMap::new()),
            pending_adds: Mutex::new(HashSet::new()),
            observers: Mutex::new(HashMap::new()),
            next_observer: AtomicU64::new(0),
            announcing: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&directory);
        directory.store.on_change(move |id, envelope| {
            if let Some(directory) = weak.upgrade() {
                directory.on_entry_changed(id, envelope);
            }
        });
        directory.bind(DIRECTORY_ID);
        directory
    }

    pub fn topic(&self) -> &str {
        self.transport.topic()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Bind `id`, write `value` as a local change and announce it.
    pub fn create(&self, id: &str, value: Value) {
        self.pending_adds.lock().insert(id.to_string());
        if !self.is_bound(id) {
            self.bind(id);
        }
        self.store.set_value(id, Envelope::Active(value));
        self.add_observable_for_id(id);
    }

    /// Write a local change. Forwarded once `id` is bound.
    pub fn set(&self, id: &str, value: Value) {
        self.store.set_value(id, Envelope::Active(value));
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.store.get_value(id).map(Envelope::into_value)
    }

    pub fn is_bound(&self, id: &str) -> bool {
        self.bindings.lock().contains_key(id)
    }

    pub fn bound_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bindings.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids listed in the local copy of the directory record.
    pub fn directory_ids(&self) -> Vec<String> {
        self.store
            .get_value(DIRECTORY_ID)
            .and_then(|envelope| ids_from_value(envelope.value()))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Snapshot {
        let bound: HashSet<String> = self.bindings.lock().keys().cloned().collect();
        self.store
            .snapshot()
            .into_iter()
            .filter(|(id, envelope)| {
                id != DIRECTORY_ID && bound.contains(id) && !is_poison_pill(envelope.value())
            })
            .map(|(id, envelope)| (id, envelope.into_value()))
            .collect()
    }

    /// Watch one id. The current value is replayed immediately. After the
    /// poison pill is delivered every observer of the id is detached.
    pub fn observe<F>(&self, id: &str, callback: F) -> ObserverId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let observer = ObserverId(self.next_observer.fetch_add(1, Ordering::Relaxed));
        let callback: ObserverCallback = Arc::new(callback);
        self.observers
            .lock()
            .entry(id.to_string())
            .or_default()
            .push((observer, callback.clone()));
        if let Some(envelope) = self.store.get_value(id) {
            callback(id, envelope.value());
        }
        observer
    }

    pub fn unobserve(&self, id: &str, observer: ObserverId) -> bool {
        let mut observers = self.observers.lock();
        let Some(list) = observers.get_mut(id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(o, _)| *o != observer);
        let removed = list.len() != before;
        if list.is_empty() {
            observers.remove(id);
        }
        removed
    }

    /// Attach a channel listener for `id` and pull its value if unset.
    pub fn bind(&self, id: &str) {
        {
            let mut bindings = self.bindings.lock();
            if bindings.contains_key(id) {
                log::warn!("{id} is already bound in {}", self.topic());
                return;
            }
            let weak = self.weak.clone();
            let listener = self.transport.listen(
                id,
                Arc::new(move |push: Push| {
                    if let Some(directory) = weak.upgrade() {
                        directory.on_push(push);
                    }
                }),
            );
            bindings.insert(id.to_string(), listener);
        }
        log::debug!("Bound {}/{id}", self.topic());

        match self.store.get_value(id) {
            None => self.pull(id),
            Some(Envelope::Active(value)) => self.forward(id, value),
            Some(Envelope::Passive(_)) => {}
        }
    }

    /// Append `id` to the directory record and propagate it.
    pub fn add_observable_for_id(&self, id: &str) {
        self.pending_adds.lock().insert(id.to_string());
        let weak = self.weak.clone();
        let id = id.to_string();
        self.scheduler.add_async(async move {
            let Some(directory) = weak.upgrade() else {
                return;
            };
            let mut ids = directory.fetch_directory_ids().await;
            if ids.contains(&id) {
                log::warn!("{id} is already in the directory");
            } else {
                ids.push(id.clone());
                directory.publish_directory(&ids).await;
            }
            // Pushes that arrived while this step ran are applied first.
            let weak = directory.weak.clone();
            directory.scheduler.add_ok(move || {
                if let Some(directory) = weak.upgrade() {
                    directory.pending_adds.lock().remove(&id);
                }
            });
        });
    }

    /// Drop `id` from the directory record and propagate it. Local teardown
    /// follows from reconciliation.
    pub fn remove_observable_for_id(&self, id: &str) {
        let weak = self.weak.clone();
        let id = id.to_string();
        self.scheduler.add_async(async move {
            let Some(directory) = weak.upgrade() else {
                return;
            };
            let mut ids = directory.fetch_directory_ids().await;
            let before = ids.len();
            ids.retain(|existing| *existing != id);
            if ids.len() == before {
                log::warn!("{id} is not in the directory");
                return;
            }
            directory.pending_adds.lock().remove(&id);
            directory.publish_directory(&ids).await;
        });
    }

    /// Reconcile bindings against a freshly received id list.
    pub fn synchronize(&self, ids: &[String]) {
        for id in ids {
            if !self.is_bound(id) {
                self.bind(id);
            }
        }

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let stale: Vec<String> = {
            let bindings = self.bindings.lock();
            let pending = self.pending_adds.lock();
            bindings
                .keys()
                .filter(|id| {
                    !wanted.contains(id.as_str()) && !is_immortal(id) && !pending.contains(*id)
                })
                .cloned()
                .collect()
        };
        for id in stale {
            self.teardown(&id);
        }
    }

    /// Fetch the directory until `check` accepts the bound entries.
    ///
    /// Retries every [`DirectoryConfig::retry_delay`] with no attempt cap.
    pub async fn ensure_all_observable_ids<F>(
        &self,
        check: F,
        cancel: &CancellationToken,
    ) -> Result<Snapshot, DirectoryError>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut attempt: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DirectoryError::Cancelled);
            }
            attempt += 1;

            self.fetch_and_synchronize().await;
            // Pulls queued by new bindings land before the check.
            self.scheduler.barrier().await;

            let snapshot = self.snapshot();
            if check(&snapshot) {
                log::debug!(
                    "Directory {} complete after {attempt} attempt(s): {} values",
                    self.topic(),
                    snapshot.len()
                );
                return Ok(snapshot);
            }

            log::debug!(
                "Directory {} incomplete (attempt {attempt}); retrying in {:?}",
                self.topic(),
                self.config.retry_delay
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(DirectoryError::Cancelled),
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    /// Pull every bound value again and apply it as passive.
    pub fn refresh(&self) {
        for id in self.bound_ids() {
            let weak = self.weak.clone();
            let transport = self.transport.clone();
            self.scheduler.add_async(async move {
                match transport.read(&id).await {
                    Ok(Some(value)) => {
                        if let Some(directory) = weak.upgrade() {
                            directory.apply_refreshed(&id, value);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Failed to refresh {id}: {e}"),
                }
            });
        }
    }

    /// Re-run the full directory fetch every time the transport reconnects.
    pub fn resync_on_reconnect(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(directory) = weak.upgrade() else {
                    break;
                };
                match event {
                    ConnectionEvent::Connected => {
                        log::info!("Reconnected to {}; resynchronizing", directory.topic());
                        match directory.ensure_all_observable_ids(|_| true, &cancel).await {
                            Ok(_) => directory.refresh(),
                            Err(DirectoryError::Cancelled) => break,
                        }
                    }
                    ConnectionEvent::Disconnected => {
                        log::info!("Lost connection to {}", directory.topic());
                    }
                }
            }
        })
    }

    fn on_entry_changed(&self, id: &str, envelope: &Envelope<Value>) {
        let inline = id == DIRECTORY_ID && self.announcing.load(Ordering::Acquire);
        if envelope.is_active() && self.is_bound(id) && !inline {
            self.forward(id, envelope.value().clone());
        }

        if id == DIRECTORY_ID {
            match ids_from_value(envelope.value()) {
                Some(ids) => self.synchronize(&ids),
                None => log::warn!("Directory record of {} is not an array", self.topic()),
            }
        }

        self.notify_observers(id, envelope.value());
    }

    fn notify_observers(&self, id: &str, value: &Value) {
        let callbacks: Vec<ObserverCallback> = {
            let mut observers = self.observers.lock();
            if is_poison_pill(value) {
                observers
                    .remove(id)
                    .map(|list| list.into_iter().map(|(_, cb)| cb).collect())
                    .unwrap_or_default()
            } else {
                observers
                    .get(id)
                    .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                    .unwrap_or_default()
            }
        };
        for callback in callbacks {
            callback(id, value);
        }
    }

    fn forward(&self, id: &str, value: Value) {
        let transport = self.transport.clone();
        let id = id.to_string();
        self.scheduler.add_async(async move {
            if let Err(e) = transport.update(&id, value).await {
                log::warn!("Failed to push {id}: {e}");
            }
        });
    }

    fn pull(&self, id: &str) {
        let weak = self.weak.clone();
        let transport = self.transport.clone();
        let id = id.to_string();
        self.scheduler.add_async(async move {
            match transport.read(&id).await {
                Ok(Some(value)) => {
                    if let Some(directory) = weak.upgrade() {
                        directory.apply_pulled(&id, value);
                    }
                }
                Ok(None) => log::debug!("No remote value for {id} yet"),
                Err(e) => log::warn!("Failed to pull {id}: {e}"),
            }
        });
    }

    fn apply_pulled(&self, id: &str, value: Value) {
        if !self.is_bound(id) {
            log::debug!("Discarding pulled value of unbound {id}");
            return;
        }
        if self.store.contains_key(id) {
            return;
        }
        self.store.set_value(id, Envelope::Passive(value));
    }

    fn apply_refreshed(&self, id: &str, value: Value) {
        if !self.is_bound(id) {
            return;
        }
        self.apply_if_changed(id, value);
    }

    /// Store `value` as passive unless the entry already holds it in either
    /// mode; a mode flip alone must not re-notify.
    fn apply_if_changed(&self, id: &str, value: Value) {
        if self.store.get_value(id).is_some_and(|current| *current.value() == value) {
            return;
        }
        self.store.set_value(id, Envelope::Passive(value));
    }

    fn on_push(&self, push: Push) {
        let weak = self.weak.clone();
        self.scheduler.add_ok(move || {
            if let Some(directory) = weak.upgrade() {
                directory.apply_push(push);
            }
        });
    }

    fn apply_push(&self, push: Push) {
        if !self.is_bound(&push.id) {
            log::debug!("Dropping push for unbound {}", push.id);
            return;
        }
        match push.action {
            PushAction::Update(value) => self.store.set_value(push.id, Envelope::Passive(value)),
            PushAction::Remove => {
                log::debug!("{} removed remotely; waiting for the directory", push.id)
            }
        }
    }

    async fn fetch_directory_ids(&self) -> Vec<String> {
        match self.transport.read(DIRECTORY_ID).await {
            Ok(Some(value)) => self.apply_if_changed(DIRECTORY_ID, value),
            Ok(None) => {}
            Err(e) => log::warn!("Failed to fetch directory of {}; using local copy: {e}", self.topic()),
        }
        self.directory_ids()
    }

    /// Write the record locally as active and push it before the next
    /// scheduled step can read the server's copy.
    async fn publish_directory(&self, ids: &[String]) {
        let value = ids_to_value(ids);
        self.announcing.store(true, Ordering::Release);
        self.store
            .set_value(DIRECTORY_ID, Envelope::Active(value.clone()));
        self.announcing.store(false, Ordering::Release);
        if let Err(e) = self.transport.update(DIRECTORY_ID, value).await {
            log::warn!("Failed to publish directory of {}: {e}", self.topic());
        }
    }

    async fn fetch_and_synchronize(&self) {
        let (tx, rx) = oneshot::channel();
        let weak = self.weak.clone();
        self.scheduler.add_async(async move {
            if let Some(directory) = weak.upgrade() {
                let ids = directory.fetch_directory_ids().await;
                directory.synchronize(&ids);
            }
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    fn teardown(&self, id: &str) {
        let Some(listener) = self.bindings.lock().remove(id) else {
            return;
        };
        self.transport.unlisten(id, listener);
        self.store.set_value(id, Envelope::Passive(poison_pill()));
        self.store.remove_key(id);

        let transport = self.transport.clone();
        let id = id.to_string();
        log::debug!("Tore down {}/{id}", self.topic());
        self.scheduler.add_async(async move {
            if let Err(e) = transport.remove(&id).await {
                log::warn!("Failed to release {id} on the server: {e}");
            }
        });
    }
}

impl<T: Transport> Drop for Directory<T> {
    fn drop(&mut self) {
        for (id, listener) in self.bindings.get_mut().drain() {
            self.transport.unlisten(&id, listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, LocalTransport};
    use serde_json::json;

    async fn setup() -> (Arc<Hub>, Arc<Directory<LocalTransport>>) {
        let hub = Arc::new(Hub::default());
        let directory = Directory::new(LocalTransport::connect(&hub, "game"), DirectoryConfig::default());
        directory.scheduler().wait_idle().await;
        (hub, directory)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_directory_record_is_bound() {
        let (_hub, directory) = setup().await;
        assert!(directory.is_bound(DIRECTORY_ID));
        assert_eq!(directory.transport().registry().listener_count(DIRECTORY_ID), 1);
    }

    #[tokio::test]
    async fn test_create_announces_and_pushes() {
        let (hub, directory) = setup().await;
        directory.create("piece-1", json!({"row": 0}));
        directory.scheduler().wait_idle().await;

        assert_eq!(hub.read("game", "piece-1"), Some(json!({"row": 0})));
        assert_eq!(hub.read("game", DIRECTORY_ID), Some(json!(["piece-1"])));
        assert_eq!(directory.directory_ids(), ids(&["piece-1"]));
        assert!(directory.is_bound("piece-1"));
    }

    #[tokio::test]
    async fn test_refetching_published_directory_does_not_renotify() {
        let (_hub, directory) = setup().await;
        directory.create("x", json!(1));
        directory.scheduler().wait_idle().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        directory.observe(DIRECTORY_ID, move |_, value| s.lock().push(value.clone()));
        assert_eq!(seen.lock().len(), 1);

        let cancel = CancellationToken::new();
        directory.ensure_all_observable_ids(|_| true, &cancel).await.unwrap();
        directory.ensure_all_observable_ids(|_| true, &cancel).await.unwrap();

        assert_eq!(*seen.lock(), vec![json!(["x"])]);
        assert_eq!(directory.directory_ids(), ids(&["x"]));
    }

    #[tokio::test]
    async fn test_idempotent_rebind() {
        let (_hub, directory) = setup().await;
        directory.bind("x");
        directory.bind("x");
        assert_eq!(directory.transport().registry().listener_count("x"), 1);
        assert_eq!(directory.bound_ids(), ids(&[DIRECTORY_ID, "x"]));
    }

    #[tokio::test]
    async fn test_bind_pulls_existing_value() {
        let (hub, directory) = setup().await;
        hub.update(uuid::Uuid::new_v4(), "game", "x", json!(5));

        directory.bind("x");
        directory.scheduler().wait_idle().await;
        assert_eq!(directory.get("x"), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_bind_forwards_unsent_local_value() {
        let (hub, directory) = setup().await;
        directory.set("x", json!("early"));
        directory.scheduler().wait_idle().await;
        assert_eq!(hub.read("game", "x"), None);

        directory.bind("x");
        directory.scheduler().wait_idle().await;
        assert_eq!(hub.read("game", "x"), Some(json!("early")));
    }

    #[tokio::test]
    async fn test_reconcile_tears_down_missing_ids() {
        let (_hub, directory) = setup().await;
        directory.synchronize(&ids(&["x", "y"]));
        directory.scheduler().wait_idle().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        directory.observe("x", move |_, v| s.lock().push(v.clone()));

        directory.synchronize(&ids(&["y"]));
        assert!(!directory.is_bound("x"));
        assert!(directory.is_bound("y"));
        assert_eq!(directory.transport().registry().listener_count("x"), 0);
        assert_eq!(*seen.lock(), vec![poison_pill()]);
        assert_eq!(directory.get("x"), None);

        // Observers were detached after the poison pill.
        directory.set("x", json!(1));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_immortal_ids_survive_reconcile() {
        let (_hub, directory) = setup().await;
        directory.bind("~settings");
        directory.synchronize(&ids(&["a"]));
        directory.synchronize(&[]);

        assert!(directory.is_bound("~settings"));
        assert!(directory.is_bound(DIRECTORY_ID));
        assert!(!directory.is_bound("a"));
    }

    #[tokio::test]
    async fn test_pending_add_survives_stale_directory() {
        let (_hub, directory) = setup().await;
        directory.create("mine", json!(1));
        // A directory that predates the announcement.
        directory.synchronize(&[]);
        assert!(directory.is_bound("mine"));

        directory.scheduler().wait_idle().await;
        assert_eq!(directory.directory_ids(), ids(&["mine"]));
    }

    #[tokio::test]
    async fn test_remove_observable_for_id() {
        let (hub, directory) = setup().await;
        directory.create("a", json!(1));
        directory.create("b", json!(2));
        directory.scheduler().wait_idle().await;
        assert_eq!(hub.read("game", DIRECTORY_ID), Some(json!(["a", "b"])));

        directory.remove_observable_for_id("a");
        directory.scheduler().wait_idle().await;

        assert_eq!(hub.read("game", DIRECTORY_ID), Some(json!(["b"])));
        assert_eq!(hub.read("game", "a"), None);
        assert!(!directory.is_bound("a"));
    }

    #[tokio::test]
    async fn test_push_for_unbound_id_is_dropped() {
        let (_hub, directory) = setup().await;
        directory.apply_push(Push::update("stranger", json!(1)));
        assert_eq!(directory.get("stranger"), None);
    }

    #[tokio::test]
    async fn test_inbound_push_is_passive() {
        let (hub, directory) = setup().await;
        directory.bind("x");
        directory.scheduler().wait_idle().await;

        hub.update(uuid::Uuid::new_v4(), "game", "x", json!("remote"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        directory.scheduler().wait_idle().await;

        assert_eq!(
            directory.store.get_value("x"),
            Some(Envelope::Passive(json!("remote")))
        );
    }

    #[tokio::test]
    async fn test_ensure_all_retries_until_check_passes() {
        let (hub, directory) = setup().await;
        let cancel = CancellationToken::new();
        let writer = uuid::Uuid::new_v4();
        hub.update(writer, "game", DIRECTORY_ID, json!(["late"]));

        let publish = {
            let hub = hub.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(700)).await;
                hub.update(writer, "game", "late", json!("here"));
            })
        };

        let snapshot = directory
            .ensure_all_observable_ids(|s| s.contains_key("late"), &cancel)
            .await
            .unwrap();
        assert_eq!(snapshot.get("late"), Some(&json!("here")));
        publish.await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_all_cancelled() {
        let (_hub, directory) = setup().await;
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });

        let result = directory.ensure_all_observable_ids(|_| false, &cancel).await;
        assert_eq!(result, Err(DirectoryError::Cancelled));
    }

    #[tokio::test]
    async fn test_failed_push_is_not_retried() {
        let (hub, directory) = setup().await;
        directory.bind("x");
        directory.scheduler().wait_idle().await;

        directory.transport().set_online(false);
        directory.set("x", json!(1));
        directory.scheduler().wait_idle().await;
        directory.transport().set_online(true);
        directory.scheduler().wait_idle().await;

        assert_eq!(hub.read("game", "x"), None);
        assert_eq!(directory.get("x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_drop_detaches_listeners() {
        let hub = Arc::new(Hub::default());
        let transport = LocalTransport::connect(&hub, "game");
        let directory = Directory::new(transport.clone(), DirectoryConfig::default());
        directory.bind("x");
        directory.scheduler().wait_idle().await;
        assert_eq!(transport.registry().channel_count(), 2);

        drop(directory);
        assert_eq!(transport.registry().channel_count(), 0);
    }
}
