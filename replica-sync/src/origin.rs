//! Origin-tagged values and the named stores that honor them.
//!
//! A [`Tagged`] value records which named store last authored it. The tag is
//! out of band: it is not part of the value's serialization, so it never
//! influences change detection.
//!
//! A [`NamedStore`] refuses to re-apply a value whose origin is its own name
//! (it is hearing its own echo) and stamps untagged values with its name.

use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::store::{ObservableStore, SubscriptionId};

/// A value plus the name of the store that authored it.
#[derive(Debug, Clone)]
pub struct Tagged<V> {
    value: V,
    origin: Option<Arc<str>>,
}

impl<V> Tagged<V> {
    /// An untagged value.
    pub fn new(value: V) -> Self {
        Self {
            value,
            origin: None,
        }
    }

    pub fn from_origin(value: V, origin: impl Into<Arc<str>>) -> Self {
        Self {
            value,
            origin: Some(origin.into()),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

impl<V: PartialEq> PartialEq for Tagged<V> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<V: Serialize> Serialize for Tagged<V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

/// An [`ObservableStore`] with a name, used as a Relay endpoint.
pub struct NamedStore<V> {
    name: Arc<str>,
    store: ObservableStore<Tagged<V>>,
}

impl<V> Clone for NamedStore<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            store: self.store.clone(),
        }
    }
}

impl<V> NamedStore<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_store(name, ObservableStore::new())
    }

    pub fn from_store(name: impl Into<String>, store: ObservableStore<Tagged<V>>) -> Self {
        Self {
            name: Arc::from(name.into()),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Author a value locally; it is stamped with this store's name.
    pub fn set_value(&self, key: impl Into<String>, value: impl Into<Option<V>>) {
        match value.into() {
            Some(value) => self
                .store
                .set_value(key, Tagged::from_origin(value, self.name.clone())),
            None => self.store.remove_key(&key.into()),
        }
    }

    /// Apply a value received from elsewhere.
    ///
    /// Returns `false` when the value is this store's own echo.
    pub fn accept(&self, key: impl Into<String>, tagged: Tagged<V>) -> bool {
        let key = key.into();
        if tagged.origin() == Some(&*self.name) {
            log::trace!("{}: ignoring own echo for {key}", self.name);
            return false;
        }
        let tagged = match tagged.origin {
            Some(_) => tagged,
            None => Tagged::from_origin(tagged.value, self.name.clone()),
        };
        self.store.set_value(key, tagged);
        true
    }

    pub fn remove_key(&self, key: &str) {
        self.store.remove_key(key);
    }

    pub fn get_value(&self, key: &str) -> Option<V> {
        self.store.get_value(key).map(Tagged::into_value)
    }

    pub fn get_tagged(&self, key: &str) -> Option<Tagged<V>> {
        self.store.get_value(key)
    }

    /// Listen for value changes with the origin stripped. Replays existing
    /// entries like [`ObservableStore::on_change`].
    pub fn on_change<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &V) + Send + Sync + 'static,
    {
        self.store.on_change(move |key, tagged| callback(key, tagged.value()))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// The underlying tagged store.
    pub fn store(&self) -> &ObservableStore<Tagged<V>> {
        &self.store
    }
}
