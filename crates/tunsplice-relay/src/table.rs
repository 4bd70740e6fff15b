//! Relay Table
//!
//! Concurrent map from [`FlowKey`] to its live [`ConnectionRelay`]. The read
//! loop inserts, relays remove themselves when they close, and the shutdown
//! sweep empties it. Every mutation is a single atomic map operation.

use crate::flow::FlowKey;
use crate::relay::ConnectionRelay;
use dashmap::DashMap;
use std::sync::Arc;

/// Engine-wide table of active relays
#[derive(Clone, Default)]
pub struct RelayTable {
    relays: Arc<DashMap<FlowKey, Arc<ConnectionRelay>>>,
}

impl RelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the relay for `key`, creating it with `factory` if absent.
    ///
    /// The entry stays locked while `factory` runs, so concurrent callers
    /// for the same key all receive the single relay it produced.
    pub fn get_or_create<F>(&self, key: FlowKey, factory: F) -> Arc<ConnectionRelay>
    where
        F: FnOnce() -> Arc<ConnectionRelay>,
    {
        self.relays.entry(key).or_insert_with(factory).value().clone()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<ConnectionRelay>> {
        self.relays.get(key).map(|entry| entry.value().clone())
    }

    /// Remove the entry for `key`, if any
    pub fn remove(&self, key: &FlowKey) -> Option<Arc<ConnectionRelay>> {
        self.relays.remove(key).map(|(_, relay)| relay)
    }

    /// Remove the entry for `key` only if it is `relay` itself.
    ///
    /// A relay that closes late never evicts the fresh relay that replaced it.
    pub fn remove_relay(&self, key: &FlowKey, relay: &ConnectionRelay) -> bool {
        self.relays
            .remove_if(key, |_, current| std::ptr::eq(Arc::as_ptr(current), relay))
            .is_some()
    }

    /// Visit every relay present when the call starts.
    ///
    /// `f` runs outside the map's locks and may close relays (which removes
    /// them from this table).
    pub fn for_each_active<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<ConnectionRelay>),
    {
        let relays: Vec<_> = self
            .relays
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for relay in &relays {
            f(relay);
        }
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.relays.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Drop every entry without closing the relays
    pub fn clear(&self) {
        self.relays.clear();
    }
}

impl std::fmt::Debug for RelayTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTable")
            .field("relays", &self.len())
            .finish()
    }
}
