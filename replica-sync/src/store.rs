//! Observable in-memory key-value store.
//!
//! The reactive primitive every other component is built on:
//!
//! ```text
//! set_value ──► canonical form ──► unchanged? ──► (no-op)
//!                     │
//!                     ▼
//!              entries map ──► key_added (new key) ──► change
//! remove_key ──► entries map ──► key_removed (last value)
//! ```
//!
//! Change detection compares canonical serializations (`serde_json::Value`)
//! rather than identity, so structurally identical writes are suppressed.
//! A value whose canonical form is JSON `null` is nullish: writing it is the
//! same as removing the key.
//!
//! The debounced variant gives every key its own timer. Writes to a key
//! inside the window replace the pending value and restart the timer; only
//! the last value is committed and notified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

/// Listener invoked with `(key, value)`.
pub type KeyCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

/// Handle returned by every subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Added,
    Removed,
    Changed,
}

struct Entry<V> {
    value: V,
    /// `None` when the value could not be serialized; such values always
    /// count as changed.
    canonical: Option<serde_json::Value>,
}

struct Observer<V> {
    id: SubscriptionId,
    event: Event,
    callback: KeyCallback<V>,
}

struct PendingWrite<V> {
    generation: u64,
    value: Option<V>,
    timer: JoinHandle<()>,
}

struct Inner<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    observers: Mutex<Vec<Observer<V>>>,
    next_subscription: AtomicU64,
    debounce: Duration,
    pending: Mutex<HashMap<String, PendingWrite<V>>>,
    generation: AtomicU64,
}

/// Reactive key→value map with add/remove/change notification.
///
/// Cheap to clone; clones share the same map and listeners.
pub struct ObservableStore<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for ObservableStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn canonical_form<V: Serialize>(value: &V) -> Option<serde_json::Value> {
    match serde_json::to_value(value) {
        Ok(canonical) => Some(canonical),
        Err(e) => {
            log::debug!("Value has no canonical form ({e}); treating every write as a change");
            None
        }
    }
}

impl<V> Inner<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn commit(&self, key: String, value: Option<V>) {
        let Some(value) = value else {
            return self.commit_removal(&key);
        };
        let canonical = canonical_form(&value);
        if matches!(canonical, Some(serde_json::Value::Null)) {
            return self.commit_removal(&key);
        }

        let added = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&key) {
                Some(existing) => {
                    if canonical.is_some() && existing.canonical == canonical {
                        return;
                    }
                    existing.value = value.clone();
                    existing.canonical = canonical;
                    false
                }
                None => {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: value.clone(),
                            canonical,
                        },
                    );
                    true
                }
            }
        };

        if added {
            self.notify(Event::Added, &key, &value);
        }
        self.notify(Event::Changed, &key, &value);
    }

    fn commit_removal(&self, key: &str) {
        let removed = self.entries.lock().remove(key);
        if let Some(entry) = removed {
            self.notify(Event::Removed, key, &entry.value);
        }
    }

    /// Callbacks run outside every lock so they may re-enter the store.
    fn notify(&self, event: Event, key: &str, value: &V) {
        let callbacks: Vec<KeyCallback<V>> = self
            .observers
            .lock()
            .iter()
            .filter(|o| o.event == event)
            .map(|o| o.callback.clone())
            .collect();
        for callback in callbacks {
            callback(key, value);
        }
    }

    fn fire(&self, key: String, generation: u64) {
        let value = {
            let mut pending = self.pending.lock();
            match pending.get(&key) {
                Some(write) if write.generation == generation => {
                    pending.remove(&key).map(|write| write.value)
                }
                _ => None,
            }
        };
        if let Some(value) = value {
            self.commit(key, value);
        }
    }

    fn subscribe(&self, event: Event, callback: KeyCallback<V>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.observers.lock().push(Observer {
            id,
            event,
            callback,
        });
        id
    }
}

impl<V> Default for ObservableStore<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ObservableStore<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Create a store that applies and notifies every write synchronously.
    pub fn new() -> Self {
        Self::with_debounce(Duration::ZERO)
    }

    /// Create a store with a per-key debounce window.
    ///
    /// `Duration::ZERO` disables debouncing.
    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
                debounce,
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// The configured debounce window.
    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Store `value` under `key`. `None` (or a nullish value) removes the key.
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Option<V>>) {
        let key = key.into();
        let value = value.into();
        if self.inner.debounce.is_zero() {
            self.inner.commit(key, value);
        } else {
            self.schedule(key, value);
        }
    }

    /// Cancel any pending debounced write for `key` and commit `value` now.
    pub fn set_value_now(&self, key: impl Into<String>, value: impl Into<Option<V>>) {
        let key = key.into();
        self.cancel_pending(&key);
        self.inner.commit(key, value.into());
    }

    /// Remove `key`, notifying removal listeners with its last value.
    pub fn remove_key(&self, key: &str) {
        self.set_value(key, Option::<V>::None);
    }

    /// Current value for `key`. Never returns a nullish value.
    pub fn get_value(&self, key: &str) -> Option<V> {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Copy of every committed entry.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        self.inner
            .entries
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Listen for keys that did not exist before.
    pub fn on_key_added<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        self.inner.subscribe(Event::Added, Arc::new(callback))
    }

    /// Listen for removed keys; the callback receives the last value.
    pub fn on_key_removed<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        self.inner.subscribe(Event::Removed, Arc::new(callback))
    }

    /// Listen for value changes.
    ///
    /// The callback is invoked once for every entry already held before this
    /// returns, so a late subscriber catches up on existing state.
    pub fn on_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        let callback: KeyCallback<V> = Arc::new(callback);
        let id = self.inner.subscribe(Event::Changed, callback.clone());
        for (key, value) in self.snapshot() {
            callback(&key, &value);
        }
        id
    }

    /// Detach a listener. Returns `false` if it was already detached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.inner.observers.lock();
        let before = observers.len();
        observers.retain(|o| o.id != id);
        observers.len() != before
    }

    /// Number of attached listeners of every kind.
    pub fn subscriber_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Number of debounced writes waiting for their timer.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Commit every pending debounced write immediately.
    pub fn flush(&self) {
        let drained: Vec<(String, PendingWrite<V>)> = self.inner.pending.lock().drain().collect();
        for (key, write) in drained {
            write.timer.abort();
            self.inner.commit(key, write.value);
        }
    }

    fn cancel_pending(&self, key: &str) {
        if let Some(write) = self.inner.pending.lock().remove(key) {
            write.timer.abort();
        }
    }

    fn schedule(&self, key: String, value: Option<V>) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                log::warn!("Debounced write to {key} outside a tokio runtime; applying immediately");
                self.cancel_pending(&key);
                return self.inner.commit(key, value);
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.debounce;
        let timer_key = key.clone();

        let mut pending = self.inner.pending.lock();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(timer_key, generation);
            }
        });
        let previous = pending.insert(
            key,
            PendingWrite {
                generation,
                value,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.abort();
        }
    }
}

impl<V> std::fmt::Debug for ObservableStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableStore")
            .field("entries", &self.inner.entries.lock().len())
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}
