//! # Sticky event store.
//!
//! Keeps the most recently posted sticky event per concrete event type so it
//! can be replayed to sticky subscriptions registered later. Every entry is
//! overwritten by the next sticky post of the same type and removable
//! explicitly; nothing else evicts.
//!
//! All operations take the store's own lock, independent of the registry lock,
//! so sticky traffic never contends with registration.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::events::PostedEvent;

/// Keyed cache of the latest sticky event per event type.
///
/// The removal predicate of [`remove_if`](StickyStore::remove_if) runs under
/// the lock; a panic there poisons the store, and every later operation
/// panics instead of masking the inconsistency.
#[derive(Default)]
pub(crate) struct StickyStore {
    entries: Mutex<HashMap<TypeId, PostedEvent>>,
}

impl StickyStore {
    /// Stores `event` as the latest of its type, replacing any previous one.
    pub(crate) fn put(&self, event: PostedEvent) {
        self.entries
            .lock()
            .unwrap()
            .insert(event.type_id().id(), event);
    }

    /// The latest event of the given type, if any.
    pub(crate) fn get(&self, event_type: TypeId) -> Option<PostedEvent> {
        self.entries.lock().unwrap().get(&event_type).cloned()
    }

    /// Removes and returns the latest event of the given type.
    pub(crate) fn remove(&self, event_type: TypeId) -> Option<PostedEvent> {
        self.entries.lock().unwrap().remove(&event_type)
    }

    /// Removes the entry for the given type if `matches` accepts it; the
    /// lookup and removal happen under one lock acquisition.
    pub(crate) fn remove_if(
        &self,
        event_type: TypeId,
        matches: impl FnOnce(&PostedEvent) -> bool,
    ) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(&event_type).is_some_and(matches) {
            entries.remove(&event_type);
            true
        } else {
            false
        }
    }

    /// Drops every entry.
    pub(crate) fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// A point-in-time copy of all entries, for inheritance-aware replay.
    pub(crate) fn snapshot(&self) -> Vec<PostedEvent> {
        self.entries.lock().unwrap().values().cloned().collect()
    }
}
