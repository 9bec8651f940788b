//! Server-authoritative collection store.
//!
//! Collections are insertion-ordered maps from `_id` to a stored entry. All
//! mutation is driven either by incoming change-stream frames or by the
//! optimistic local halves of `insert`/`remove`; `update` mutates nothing
//! locally and relies on the server echoing a `changed`.

pub mod codec;
pub mod dispatch;

use serde_json::{Map, Value};

use crate::core::document::Document;
use crate::core::ordered_map::OrderedMap;
use codec::{Codec, CodecRegistry, TypedDocument};
use dispatch::ChangeEvent;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeReason {
    Added,
    AddedBefore,
    Changed,
    MovedBefore,
    Removed,
}

/// A stored value: the canonical EJSON document, plus the decoded typed
/// value when a codec was registered at arrival time.
#[derive(Debug)]
pub struct StoredEntry {
    pub doc: Document,
    pub typed: Option<Box<dyn TypedDocument>>,
}

impl Clone for StoredEntry {
    fn clone(&self) -> Self {
        Self {
            doc: self.doc.clone(),
            typed: self.typed.as_ref().map(|typed| typed.clone_boxed()),
        }
    }
}

impl StoredEntry {
    pub fn id(&self) -> &str {
        self.doc.id()
    }

    pub fn typed_ref(&self) -> Option<&dyn TypedDocument> {
        self.typed.as_deref()
    }
}

type Collection = OrderedMap<String, StoredEntry>;

#[derive(Default)]
pub struct CollectionStore {
    collections: std::collections::HashMap<String, Collection>,
    codecs: CodecRegistry,
}

impl CollectionStore {
    pub fn register_codec(&mut self, collection: &str, codec: Box<dyn Codec>) {
        if self.codecs.register(collection, codec) {
            tracing::warn!(collection, "replacing previously registered codec");
        }
    }

    pub fn codec_registered(&self, collection: &str) -> bool {
        self.codecs.is_registered(collection)
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<&StoredEntry> {
        self.collections.get(collection)?.get(id)
    }

    pub fn find(
        &self,
        collection: &str,
        predicate: impl Fn(&StoredEntry) -> bool,
    ) -> Vec<StoredEntry> {
        let Some(map) = self.collections.get(collection) else {
            return Vec::new();
        };
        map.values().filter(|e| predicate(e)).cloned().collect()
    }

    pub fn ids_in_order(&self, collection: &str) -> Vec<String> {
        self.collections
            .get(collection)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, Collection::len)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// `added`: append to the end of the collection's order.
    pub fn apply_added(
        &mut self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> ChangeEvent {
        let entry = build_entry(
            &self.codecs,
            collection,
            Document::from_frame_fields(id, fields),
        );
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), entry.clone());
        change(collection, ChangeReason::Added, id, Some(entry))
    }

    /// `addedBefore`: insert before `before`; an unknown (or absent)
    /// `before` appends.
    pub fn apply_added_before(
        &mut self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        before: Option<&str>,
    ) -> ChangeEvent {
        let entry = build_entry(
            &self.codecs,
            collection,
            Document::from_frame_fields(id, fields),
        );
        let map = self.collections.entry(collection.to_string()).or_default();
        match before.and_then(|b| map.index_of(b)) {
            Some(index) => {
                map.insert_at(id.to_string(), entry.clone(), index);
            }
            None => {
                map.insert(id.to_string(), entry.clone());
            }
        }
        change(collection, ChangeReason::AddedBefore, id, Some(entry))
    }

    /// `changed`: merge into the stored document in place (position is
    /// preserved) and re-decode through the codec. An unknown document is
    /// stored as if newly added.
    pub fn apply_changed(
        &mut self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
        cleared: Vec<String>,
    ) -> ChangeEvent {
        let known = self
            .collections
            .get(collection)
            .is_some_and(|map| map.contains_key(id));
        if !known {
            tracing::warn!(collection, id, "changed for unknown document; storing as added");
            let mut event = self.apply_added(collection, id, fields);
            event.reason = ChangeReason::Changed;
            return event;
        }

        let map = self
            .collections
            .get_mut(collection)
            .expect("collection exists for known document");
        let slot = map.get_mut(id).expect("entry exists for known document");
        slot.doc.apply_change(&fields, &cleared);
        let rebuilt = build_entry(&self.codecs, collection, slot.doc.clone());
        *slot = rebuilt.clone();
        change(collection, ChangeReason::Changed, id, Some(rebuilt))
    }

    /// `movedBefore`: detach and reinsert at the position `before` held when
    /// the frame arrived; no (or unknown) `before` moves to the end.
    pub fn apply_moved_before(
        &mut self,
        collection: &str,
        id: &str,
        before: Option<&str>,
    ) -> Option<ChangeEvent> {
        let map = self.collections.get_mut(collection)?;
        if !map.contains_key(id) {
            tracing::warn!(collection, id, "movedBefore for unknown document; ignoring");
            return None;
        }
        let target = before.and_then(|b| map.index_of(b)).unwrap_or(map.len());
        map.move_to(id, target);
        let entry = map.get(id).cloned();
        Some(change(collection, ChangeReason::MovedBefore, id, entry))
    }

    /// `removed`: the event carries the prior value (`None` when unknown).
    pub fn apply_removed(&mut self, collection: &str, id: &str) -> ChangeEvent {
        let prior = self
            .collections
            .get_mut(collection)
            .and_then(|map| map.remove(id));
        change(collection, ChangeReason::Removed, id, prior)
    }

    /// Optimistic local half of `insert`: the caller's document is stored
    /// raw; the authoritative `added` echoed by the server replaces it with
    /// the decoded value.
    pub fn insert_local(&mut self, collection: &str, doc: Document) -> ChangeEvent {
        let id = doc.id().to_string();
        let entry = StoredEntry { doc, typed: None };
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), entry.clone());
        change(collection, ChangeReason::Added, &id, Some(entry))
    }

    /// Optimistic local half of `remove`.
    pub fn remove_local(&mut self, collection: &str, id: &str) -> ChangeEvent {
        self.apply_removed(collection, id)
    }

    /// Cache-restored document: decoded through the codec like a server
    /// `added`, appended without touching the wire.
    pub fn insert_restored(&mut self, collection: &str, doc: Document) -> ChangeEvent {
        let id = doc.id().to_string();
        let entry = build_entry(&self.codecs, collection, doc);
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), entry.clone());
        change(collection, ChangeReason::Added, &id, Some(entry))
    }

    /// Reconnect reset: every collection keeps only offline-restored
    /// entries, which survive until server truth replaces them.
    pub fn reset_keeping_offline(&mut self) {
        for map in self.collections.values_mut() {
            map.retain(|_, entry| entry.doc.was_offline());
        }
    }

    /// Stamp `_lastUpdated_` on entries lacking one and snapshot the
    /// collection's documents in order, for the persist path.
    pub fn stamp_and_snapshot(&mut self, collection: &str, now_ms: i64) -> Vec<Document> {
        let Some(map) = self.collections.get_mut(collection) else {
            return Vec::new();
        };
        for entry in map.values_mut() {
            entry.doc.stamp_last_updated(now_ms);
        }
        map.values().map(|entry| entry.doc.clone()).collect()
    }

    /// Drop every entry still flagged `_wasOffline_`; returns their removal
    /// events in order.
    pub fn clear_offline_entries(&mut self, collection: &str) -> Vec<ChangeEvent> {
        let Some(map) = self.collections.get_mut(collection) else {
            return Vec::new();
        };
        let flagged: Vec<String> = map
            .iter()
            .filter(|(_, entry)| entry.doc.was_offline())
            .map(|(id, _)| id.clone())
            .collect();
        flagged
            .into_iter()
            .map(|id| {
                let prior = map.remove(&id);
                change(collection, ChangeReason::Removed, &id, prior)
            })
            .collect()
    }
}

fn change(collection: &str, reason: ChangeReason, id: &str, value: Option<StoredEntry>) -> ChangeEvent {
    ChangeEvent {
        collection: collection.to_string(),
        reason,
        id: id.to_string(),
        value,
    }
}

fn build_entry(codecs: &CodecRegistry, collection: &str, doc: Document) -> StoredEntry {
    let typed = match codecs.get(collection) {
        Some(codec) => match codec.decode(&doc) {
            Ok(typed) => Some(typed),
            Err(err) => {
                tracing::warn!(
                    collection,
                    id = doc.id(),
                    %err,
                    "document decode failed; keeping raw fields"
                );
                None
            }
        },
        None => None,
    };
    StoredEntry { doc, typed }
}

/// Build the Mongo-shaped modifier for `update`: non-null values become
/// `$set` entries, null marks a field for `$unset`.
pub fn build_update_modifier(changes: Map<String, Value>) -> Value {
    let mut set = Map::new();
    let mut unset = Map::new();
    for (field, value) in changes {
        if value.is_null() {
            unset.insert(field, Value::String(String::new()));
        } else {
            set.insert(field, value);
        }
    }
    let mut modifier = Map::new();
    if !set.is_empty() {
        modifier.insert("$set".to_string(), Value::Object(set));
    }
    if !unset.is_empty() {
        modifier.insert("$unset".to_string(), Value::Object(unset));
    }
    Value::Object(modifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use crate::core::ejson::EjsonDate;
    use crate::store::codec::JsonCodec;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn change_stream_ordering_scenario() {
        // added a, added b, x before b, move a before x => x, a, b
        let mut store = CollectionStore::default();
        store.apply_added("c", "a", Map::new());
        store.apply_added("c", "b", Map::new());
        store.apply_added_before("c", "x", Map::new(), Some("b"));
        assert_eq!(store.ids_in_order("c"), ["a", "x", "b"]);

        store.apply_moved_before("c", "a", Some("x"));
        assert_eq!(store.ids_in_order("c"), ["x", "a", "b"]);
    }

    #[test]
    fn added_before_unknown_target_appends() {
        let mut store = CollectionStore::default();
        store.apply_added("c", "a", Map::new());
        store.apply_added_before("c", "z", Map::new(), Some("ghost"));
        assert_eq!(store.ids_in_order("c"), ["a", "z"]);
    }

    #[test]
    fn moved_before_without_target_moves_to_end() {
        let mut store = CollectionStore::default();
        store.apply_added("c", "a", Map::new());
        store.apply_added("c", "b", Map::new());
        store.apply_moved_before("c", "a", None);
        assert_eq!(store.ids_in_order("c"), ["b", "a"]);
    }

    #[test]
    fn changed_merges_in_place() {
        let mut store = CollectionStore::default();
        store.apply_added("c", "a", fields(json!({"keep": 1, "drop": 2})));
        store.apply_added("c", "b", Map::new());

        let event = store.apply_changed(
            "c",
            "a",
            fields(json!({"fresh": 3})),
            vec!["drop".to_string()],
        );
        assert_eq!(event.reason, ChangeReason::Changed);
        let entry = store.get("c", "a").unwrap();
        assert_eq!(entry.doc.get("keep"), Some(&json!(1)));
        assert_eq!(entry.doc.get("fresh"), Some(&json!(3)));
        assert_eq!(entry.doc.get("drop"), None);
        // Position preserved.
        assert_eq!(store.ids_in_order("c"), ["a", "b"]);
    }

    #[test]
    fn changed_for_unknown_document_stores_as_added() {
        let mut store = CollectionStore::default();
        let event = store.apply_changed("c", "new", fields(json!({"n": 1})), Vec::new());
        assert_eq!(event.reason, ChangeReason::Changed);
        assert_eq!(store.ids_in_order("c"), ["new"]);
        assert_eq!(store.get("c", "new").unwrap().doc.get("n"), Some(&json!(1)));
    }

    #[test]
    fn removed_carries_prior_value() {
        let mut store = CollectionStore::default();
        store.apply_added("c", "a", fields(json!({"n": 7})));

        let event = store.apply_removed("c", "a");
        assert_eq!(event.reason, ChangeReason::Removed);
        assert_eq!(
            event.value.unwrap().doc.get("n"),
            Some(&json!(7))
        );

        let missing = store.apply_removed("c", "a");
        assert!(missing.value.is_none());
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Msg {
        _id: String,
        body: String,
        time: EjsonDate,
    }

    #[test]
    fn codec_decodes_on_arrival() {
        let mut store = CollectionStore::default();
        store.register_codec("msgs", Box::new(JsonCodec::<Msg>::new()));

        store.apply_added(
            "msgs",
            "1",
            fields(json!({"body": "hi", "time": {"$date": 1_700_000_000_000_i64}})),
        );
        let entry = store.get("msgs", "1").unwrap();
        let msg = entry
            .typed_ref()
            .and_then(|t| t.as_any().downcast_ref::<Msg>())
            .unwrap();
        assert_eq!(msg.body, "hi");
        assert_eq!(msg.time.epoch_ms(), 1_700_000_000_000);
    }

    #[test]
    fn decode_failure_falls_back_to_raw() {
        let mut store = CollectionStore::default();
        store.register_codec("msgs", Box::new(JsonCodec::<Msg>::new()));

        store.apply_added("msgs", "1", fields(json!({"body": 42})));
        let entry = store.get("msgs", "1").unwrap();
        assert!(entry.typed.is_none());
        assert_eq!(entry.doc.get("body"), Some(&json!(42)));
    }

    #[test]
    fn late_codec_registration_is_not_retroactive() {
        let mut store = CollectionStore::default();
        store.apply_added(
            "msgs",
            "1",
            fields(json!({"body": "hi", "time": {"$date": 5}})),
        );
        store.register_codec("msgs", Box::new(JsonCodec::<Msg>::new()));
        assert!(store.get("msgs", "1").unwrap().typed.is_none());

        // A change re-decodes through the now-registered codec.
        store.apply_changed("msgs", "1", fields(json!({"body": "yo"})), Vec::new());
        assert!(store.get("msgs", "1").unwrap().typed.is_some());
    }

    #[test]
    fn optimistic_insert_stays_raw_until_server_echo() {
        let mut store = CollectionStore::default();
        store.register_codec("msgs", Box::new(JsonCodec::<Msg>::new()));

        let doc = Document::from_value(
            json!({"_id": "local", "body": "hi", "time": {"$date": 5}}),
        )
        .unwrap();
        store.insert_local("msgs", doc);
        assert!(store.get("msgs", "local").unwrap().typed.is_none());

        store.apply_added(
            "msgs",
            "local",
            fields(json!({"body": "hi", "time": {"$date": 5}})),
        );
        assert!(store.get("msgs", "local").unwrap().typed.is_some());
    }

    #[test]
    fn reset_spares_offline_entries() {
        let mut store = CollectionStore::default();
        let mut cached = Document::new("cached");
        cached.flag_was_offline();
        store.insert_restored("c", cached);
        store.apply_added("c", "live", Map::new());

        store.reset_keeping_offline();
        assert_eq!(store.ids_in_order("c"), ["cached"]);

        // Server truth replaces the cached entry and drops the flag.
        store.apply_added("c", "cached", Map::new());
        assert!(!store.get("c", "cached").unwrap().doc.was_offline());
        store.reset_keeping_offline();
        assert!(store.ids_in_order("c").is_empty());
    }

    #[test]
    fn clear_offline_removes_only_flagged_entries() {
        let mut store = CollectionStore::default();
        let mut cached = Document::new("cached");
        cached.flag_was_offline();
        store.insert_restored("c", cached);
        store.apply_added("c", "live", Map::new());

        let events = store.clear_offline_entries("c");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "cached");
        assert_eq!(store.ids_in_order("c"), ["live"]);
    }

    #[test]
    fn stamp_and_snapshot_preserves_existing_stamps() {
        let mut store = CollectionStore::default();
        store.apply_added("c", "a", fields(json!({"_lastUpdated_": {"$date": 111}})));
        store.apply_added("c", "b", Map::new());

        let docs = store.stamp_and_snapshot("c", 999);
        assert_eq!(docs[0].get("_lastUpdated_"), Some(&json!({"$date": 111})));
        assert_eq!(docs[1].get("_lastUpdated_"), Some(&json!({"$date": 999})));
    }

    #[test]
    fn update_modifier_splits_set_and_unset() {
        let modifier = build_update_modifier(fields(json!({
            "name": "x",
            "stale": null
        })));
        assert_eq!(
            modifier,
            json!({"$set": {"name": "x"}, "$unset": {"stale": ""}})
        );

        let set_only = build_update_modifier(fields(json!({"n": 1})));
        assert_eq!(set_only, json!({"$set": {"n": 1}}));
    }
}
