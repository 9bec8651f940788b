//! Insertion-ordered map with positional insert and reorder.
//!
//! Substrate for every collection: iteration follows insertion order, and the
//! protocol can require inserting before an existing key (`insert_at`) or
//! moving a key to a new position (`move_to`).

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Clone, Debug)]
pub struct OrderedMap<K, V> {
    order: Vec<K>,
    values: HashMap<K, V>,
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            values: HashMap::new(),
        }
    }
}

impl<K, V> OrderedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.values.contains_key(key)
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.values.get(key)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.values.get_mut(key)
    }

    pub fn index_of<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.order.iter().position(|k| k.borrow() == key)
    }

    /// Insert at the end. An existing key is detached from its old position
    /// first, so a re-insert lands at the tail.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let prev = self.remove(&key);
        self.order.push(key.clone());
        self.values.insert(key, value);
        prev
    }

    /// Insert at `index` (clamped to the current length). An existing key is
    /// detached from its old position first.
    pub fn insert_at(&mut self, key: K, value: V, index: usize) -> Option<V> {
        let prev = self.remove(&key);
        let index = index.min(self.order.len());
        self.order.insert(index, key.clone());
        self.values.insert(key, value);
        prev
    }

    /// Detach `key` and reinsert it at `index`, where `index` is interpreted
    /// against the order *after* the key is detached (clamped to the length).
    /// Returns false when the key is absent.
    pub fn move_to<Q>(&mut self, key: &Q, index: usize) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let Some(current) = self.index_of(key) else {
            return false;
        };
        let owned = self.order.remove(current);
        let index = index.min(self.order.len());
        self.order.insert(index, owned);
        true
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let value = self.values.remove(key)?;
        if let Some(index) = self.order.iter().position(|k| k.borrow() == key) {
            self.order.remove(index);
        }
        Some(value)
    }

    /// Keep only entries for which the predicate holds, preserving order.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let values = &self.values;
        let removed: Vec<K> = self
            .order
            .iter()
            .filter(|&k| values.get(k).is_some_and(|v| !keep(k, v)))
            .cloned()
            .collect();
        for key in removed {
            self.remove(&key);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.order.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order.iter().filter_map(|k| {
            let value = self.values.get(k)?;
            Some((k, value))
        })
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        // Order does not matter for mutation; hand out the backing map's view.
        self.values.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(map: &OrderedMap<String, u32>) -> Vec<&str> {
        map.keys().map(String::as_str).collect()
    }

    fn map_of(entries: &[(&str, u32)]) -> OrderedMap<String, u32> {
        let mut map = OrderedMap::new();
        for (k, v) in entries {
            map.insert((*k).to_string(), *v);
        }
        map
    }

    #[test]
    fn insert_preserves_arrival_order() {
        let map = map_of(&[("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(keys(&map), ["a", "b", "c"]);
        assert_eq!(map.index_of("b"), Some(1));
    }

    #[test]
    fn reinsert_moves_to_tail_and_replaces() {
        let mut map = map_of(&[("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(map.insert("a".to_string(), 9), Some(1));
        assert_eq!(keys(&map), ["b", "c", "a"]);
        assert_eq!(map.get("a"), Some(&9));
    }

    #[test]
    fn insert_at_lands_before_target() {
        let mut map = map_of(&[("a", 1), ("b", 2)]);
        let index = map.index_of("b").unwrap();
        map.insert_at("x".to_string(), 7, index);
        assert_eq!(keys(&map), ["a", "x", "b"]);
    }

    #[test]
    fn insert_at_clamps_past_end() {
        let mut map = map_of(&[("a", 1)]);
        map.insert_at("z".to_string(), 2, 42);
        assert_eq!(keys(&map), ["a", "z"]);
    }

    #[test]
    fn move_to_uses_pre_detach_index() {
        // a,x,b; moving "a" to index_of("x") computed before the detach
        // yields x,a,b.
        let mut map = map_of(&[("a", 1), ("x", 2), ("b", 3)]);
        let target = map.index_of("x").unwrap();
        assert!(map.move_to("a", target));
        assert_eq!(keys(&map), ["x", "a", "b"]);
    }

    #[test]
    fn move_to_end() {
        let mut map = map_of(&[("a", 1), ("b", 2), ("c", 3)]);
        assert!(map.move_to("a", map.len()));
        assert_eq!(keys(&map), ["b", "c", "a"]);
    }

    #[test]
    fn move_of_missing_key_is_false() {
        let mut map = map_of(&[("a", 1)]);
        assert!(!map.move_to("nope", 0));
        assert_eq!(keys(&map), ["a"]);
    }

    #[test]
    fn remove_drops_order_slot() {
        let mut map = map_of(&[("a", 1), ("b", 2), ("c", 3)]);
        assert_eq!(map.remove("b"), Some(2));
        assert_eq!(keys(&map), ["a", "c"]);
        assert_eq!(map.remove("b"), None);
    }

    #[test]
    fn retain_preserves_order() {
        let mut map = map_of(&[("a", 1), ("b", 2), ("c", 3), ("d", 4)]);
        map.retain(|_, v| v % 2 == 0);
        assert_eq!(keys(&map), ["b", "d"]);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn iter_pairs_in_order() {
        let map = map_of(&[("b", 2), ("a", 1)]);
        let pairs: Vec<(&str, u32)> = map.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        assert_eq!(pairs, [("b", 2), ("a", 1)]);
    }
}
