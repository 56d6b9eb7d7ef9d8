//! Keyed registry with speculative (two-phase) insertion and removal.
//!
//! A create reserves its key first, does the slow work with no lock held and
//! then either commits or abandons the reservation. A delete takes the entry
//! out first and puts it back with [`Registry::restore`] if teardown fails.
//! The registry itself is not synchronized; owners wrap it in a mutex.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

enum Slot<V> {
    /// Reserved by an in-flight create. May carry a provisional value that is
    /// visible to conflict checks but not to lookups.
    Pending(Option<Arc<V>>),
    /// Fully provisioned.
    Ready(Arc<V>),
}

/// Map from id to entity, with placeholder support.
pub struct Registry<K, V> {
    slots: HashMap<K, Slot<V>>,
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Whether `key` is taken, by a ready entry or a reservation.
    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    /// Reserve `key` for an in-flight create.
    ///
    /// Returns `false` if the key is already taken; the registry is not
    /// modified in that case.
    pub fn reserve(&mut self, key: K, provisional: Option<Arc<V>>) -> bool {
        if self.slots.contains_key(&key) {
            return false;
        }
        self.slots.insert(key, Slot::Pending(provisional));
        true
    }

    /// Turn the reservation for `key` into a ready entry.
    ///
    /// Returns `false` if there was no reservation to commit.
    pub fn commit(&mut self, key: &K, value: Arc<V>) -> bool {
        match self.slots.get_mut(key) {
            Some(slot @ Slot::Pending(_)) => {
                *slot = Slot::Ready(value);
                true
            }
            _ => false,
        }
    }

    /// Drop the reservation for `key`. Ready entries are left alone.
    pub fn abandon(&mut self, key: &K) -> bool {
        if matches!(self.slots.get(key), Some(Slot::Pending(_))) {
            self.slots.remove(key);
            return true;
        }
        false
    }

    /// Look up a ready entry.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        match self.slots.get(key) {
            Some(Slot::Ready(value)) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Speculatively remove a ready entry.
    pub fn take(&mut self, key: &K) -> Option<Arc<V>> {
        if matches!(self.slots.get(key), Some(Slot::Ready(_))) {
            return match self.slots.remove(key) {
                Some(Slot::Ready(value)) => Some(value),
                _ => None,
            };
        }
        None
    }

    /// Put back an entry removed with [`Registry::take`].
    ///
    /// The slot is only filled if it is still vacant: an entry created under
    /// the same key in the meantime is kept and `false` is returned.
    pub fn restore(&mut self, key: K, value: Arc<V>) -> bool {
        if self.slots.contains_key(&key) {
            return false;
        }
        self.slots.insert(key, Slot::Ready(value));
        true
    }

    /// Ready entries.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(value) => Some(Arc::clone(value)),
                Slot::Pending(_) => None,
            })
            .collect()
    }

    /// Ready entries plus provisional values of reservations.
    pub fn all_values(&self) -> Vec<Arc<V>> {
        self.slots
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(value) | Slot::Pending(Some(value)) => Some(Arc::clone(value)),
                Slot::Pending(None) => None,
            })
            .collect()
    }

    /// Ids of ready entries.
    pub fn keys(&self) -> Vec<K> {
        self.slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of taken keys, reservations included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no key is taken, reservations included.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
