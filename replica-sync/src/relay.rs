//! Bidirectional synchronizer between two named stores.
//!
//! ```text
//!   ┌──────────┐   added / removed / change   ┌──────────┐
//!   │ store A  │ ───────────┐    ┌─────────── │ store B  │
//!   └──────────┘            ▼    ▼            └──────────┘
//!        ▲              ┌────────────┐              ▲
//!        └───────────── │ Scheduler  │ ─────────────┘
//!                       └────────────┘
//! ```
//!
//! Both directions share one scheduler, so a burst of writes on either side
//! resolves in submission order. Values carry their origin; a store refuses
//! its own echo, so every change reaches a fixed point after one hop.
//!
//! Two writes to the same key on both sides within one scheduling tick are
//! not reconciled: each side may end up with the other's value. Producers
//! that need strict ordering funnel same-key writes through one side.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::origin::NamedStore;
use crate::scheduler::Scheduler;
use crate::store::SubscriptionId;

/// Keys whose removal is being applied by the relay itself.
type Removals = Arc<Mutex<HashSet<String>>>;

/// Remove `key` from `target` without relaying the removal back.
fn remove_relayed<V>(target: &NamedStore<V>, removals: &Removals, key: &str)
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    removals.lock().insert(key.to_string());
    target.remove_key(key);
    removals.lock().remove(key);
}

/// Keeps two [`NamedStore`]s convergent until dropped or detached.
pub struct Relay<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    a: NamedStore<V>,
    b: NamedStore<V>,
    scheduler: Scheduler,
    a_subscriptions: Vec<SubscriptionId>,
    b_subscriptions: Vec<SubscriptionId>,
}

impl<V> Relay<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    /// Link `a` and `b`. Entries already present on either side are relayed
    /// to the other.
    pub fn new(a: NamedStore<V>, b: NamedStore<V>, scheduler: Scheduler) -> Self {
        let (into_a, into_b) = (Removals::default(), Removals::default());
        let a_subscriptions = Self::forward(&a, &b, &scheduler, &into_a, &into_b);
        let b_subscriptions = Self::forward(&b, &a, &scheduler, &into_b, &into_a);
        log::debug!("Relay linked {} <-> {}", a.name(), b.name());
        Self {
            a,
            b,
            scheduler,
            a_subscriptions,
            b_subscriptions,
        }
    }

    /// Wire the three rules from `from` to `to`.
    ///
    /// `inbound` holds keys this relay is currently removing from `from`;
    /// their removal events are not relayed back. `outbound` is the same set
    /// for `to`.
    fn forward(
        from: &NamedStore<V>,
        to: &NamedStore<V>,
        scheduler: &Scheduler,
        inbound: &Removals,
        outbound: &Removals,
    ) -> Vec<SubscriptionId> {
        let added = {
            let (source, target, scheduler) = (from.clone(), to.clone(), scheduler.clone());
            let outbound = outbound.clone();
            from.store().on_key_added(move |key, _| {
                let (source, target, key) = (source.clone(), target.clone(), key.to_string());
                let outbound = outbound.clone();
                scheduler.add_ok(move || match source.get_tagged(&key) {
                    Some(tagged) => {
                        target.accept(key, tagged);
                    }
                    // Removed before this step ran.
                    None => remove_relayed(&target, &outbound, &key),
                });
            })
        };

        let removed = {
            let (source, target, scheduler) = (from.clone(), to.clone(), scheduler.clone());
            let (inbound, outbound) = (inbound.clone(), outbound.clone());
            from.store().on_key_removed(move |key, _| {
                if inbound.lock().contains(key) {
                    return;
                }
                let (source, target, key) = (source.clone(), target.clone(), key.to_string());
                let outbound = outbound.clone();
                scheduler.add_ok(move || {
                    // Written again since; the added rule carries the new value.
                    if source.get_tagged(&key).is_none() {
                        remove_relayed(&target, &outbound, &key);
                    }
                });
            })
        };

        let changed = {
            let (target, scheduler) = (to.clone(), scheduler.clone());
            from.store().on_change(move |key, tagged| {
                let (target, key, tagged) = (target.clone(), key.to_string(), tagged.clone());
                scheduler.add_ok(move || {
                    log::trace!("Relaying {key} to {}", target.name());
                    target.accept(key, tagged);
                });
            })
        };

        vec![added, removed, changed]
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Stop relaying. Already queued steps still run.
    pub fn detach(&mut self) {
        for id in self.a_subscriptions.drain(..) {
            self.a.unsubscribe(id);
        }
        for id in self.b_subscriptions.drain(..) {
            self.b.unsubscribe(id);
        }
    }

    pub fn is_attached(&self) -> bool {
        !self.a_subscriptions.is_empty()
    }
}

impl<V> Drop for Relay<V>
where
    V: Clone + Serialize + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.detach();
    }
}
