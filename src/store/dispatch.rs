//! Change fan-out to registered watchers.
//!
//! Two tables per collection: id-watchers keyed to a single document, and
//! predicate-watchers filtering on the post-op value. Within each table,
//! callbacks run in registration order on the worker thread. A panicking
//! callback is isolated so it cannot break dispatch to the others.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};

use super::{ChangeReason, StoredEntry};

pub type WatcherId = u64;

/// Receives the post-op value. The two tables differ on removal: an
/// id-watcher gets the prior-value snapshot, a predicate-watcher gets
/// `value: None`.
pub type WatchCallback = Box<dyn FnMut(&ChangeEvent) + Send>;
pub type WatchPredicate = Box<dyn Fn(&StoredEntry) -> bool + Send>;

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub collection: String,
    pub reason: ChangeReason,
    pub id: String,
    /// Post-op value; for `Removed` the prior value (`None` when the
    /// document was unknown).
    pub value: Option<StoredEntry>,
}

struct IdWatcher {
    target: String,
    callback: WatchCallback,
}

struct PredicateWatcher {
    predicate: Option<WatchPredicate>,
    callback: WatchCallback,
}

#[derive(Default)]
struct CollectionWatchers {
    by_id: BTreeMap<WatcherId, IdWatcher>,
    by_predicate: BTreeMap<WatcherId, PredicateWatcher>,
}

#[derive(Default)]
pub struct ChangeDispatcher {
    next_id: WatcherId,
    collections: HashMap<String, CollectionWatchers>,
}

impl ChangeDispatcher {
    pub fn watch_document(
        &mut self,
        collection: impl Into<String>,
        target: impl Into<String>,
        callback: WatchCallback,
    ) -> WatcherId {
        let id = self.allocate();
        self.collections
            .entry(collection.into())
            .or_default()
            .by_id
            .insert(
                id,
                IdWatcher {
                    target: target.into(),
                    callback,
                },
            );
        id
    }

    pub fn watch(
        &mut self,
        collection: impl Into<String>,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    ) -> WatcherId {
        let id = self.allocate();
        self.collections
            .entry(collection.into())
            .or_default()
            .by_predicate
            .insert(id, PredicateWatcher { predicate, callback });
        id
    }

    /// Register under a pre-allocated id. Registration must not require a
    /// reply, watchers are allowed to register from inside a callback.
    pub fn watch_document_with_id(
        &mut self,
        id: WatcherId,
        collection: impl Into<String>,
        target: impl Into<String>,
        callback: WatchCallback,
    ) {
        self.next_id = self.next_id.max(id);
        self.collections
            .entry(collection.into())
            .or_default()
            .by_id
            .insert(
                id,
                IdWatcher {
                    target: target.into(),
                    callback,
                },
            );
    }

    pub fn watch_with_id(
        &mut self,
        id: WatcherId,
        collection: impl Into<String>,
        predicate: Option<WatchPredicate>,
        callback: WatchCallback,
    ) {
        self.next_id = self.next_id.max(id);
        self.collections
            .entry(collection.into())
            .or_default()
            .by_predicate
            .insert(id, PredicateWatcher { predicate, callback });
    }

    pub fn remove(&mut self, watcher: WatcherId) -> bool {
        for watchers in self.collections.values_mut() {
            if watchers.by_id.remove(&watcher).is_some()
                || watchers.by_predicate.remove(&watcher).is_some()
            {
                return true;
            }
        }
        false
    }

    pub fn dispatch(&mut self, event: &ChangeEvent) {
        let Some(watchers) = self.collections.get_mut(&event.collection) else {
            return;
        };

        for (id, watcher) in watchers.by_id.iter_mut() {
            if watcher.target == event.id {
                invoke(*id, &mut watcher.callback, event);
            }
        }

        // Removals reach every predicate-watcher with the value nulled; the
        // prior-value snapshot travels only to id-watchers.
        let nulled;
        let predicate_event = if event.reason == ChangeReason::Removed {
            nulled = ChangeEvent {
                collection: event.collection.clone(),
                reason: event.reason,
                id: event.id.clone(),
                value: None,
            };
            &nulled
        } else {
            event
        };

        for (id, watcher) in watchers.by_predicate.iter_mut() {
            if event.reason != ChangeReason::Removed
                && let Some(predicate) = &watcher.predicate
            {
                let passes = event.value.as_ref().is_some_and(|value| predicate(value));
                if !passes {
                    continue;
                }
            }
            invoke(*id, &mut watcher.callback, predicate_event);
        }
    }

    fn allocate(&mut self) -> WatcherId {
        self.next_id += 1;
        self.next_id
    }
}

fn invoke(id: WatcherId, callback: &mut WatchCallback, event: &ChangeEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        tracing::warn!(
            watcher = id,
            collection = %event.collection,
            "watcher callback panicked; continuing dispatch"
        );
    }
}
