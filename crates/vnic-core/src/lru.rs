//! Fixed-capacity least-recently-used cache.
//!
//! Entries live in a dense `Vec` linked into a recency list by index, with a
//! `HashMap` from key to slot. Removal swaps the last slot into the hole and
//! patches the links of the moved entry, so no slot is ever left empty.

use std::collections::HashMap;
use std::hash::Hash;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// A bounded map that evicts its least recently used entry when full.
///
/// `get` and `find` count as a use and move the entry to the front; `put`
/// on an existing key updates the value and also moves it to the front.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    nodes: Vec<Node<K, V>>,
    /// Most recently used.
    head: Option<usize>,
    /// Least recently used.
    tail: Option<usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; a cache that can hold nothing is a
    /// caller bug.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "invalid capacity");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.promote(idx);
        Some(&self.nodes[idx].value)
    }

    /// Return the first entry accepted by `filter`, marking it most recently
    /// used. Iteration order is unspecified.
    pub fn find<F>(&mut self, mut filter: F) -> Option<(&K, &V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let idx = self.nodes.iter().position(|n| filter(&n.key, &n.value))?;
        self.promote(idx);
        let node = &self.nodes[idx];
        Some((&node.key, &node.value))
    }

    /// Insert or update `key`.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&idx) = self.map.get(&key) {
            self.nodes[idx].value = value;
            self.promote(idx);
            return None;
        }

        let evicted = if self.nodes.len() == self.capacity {
            self.tail.map(|tail| self.remove_at(tail))
        } else {
            None
        };

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        });
        self.map.insert(key, idx);
        self.attach_front(idx);
        evicted
    }

    /// Remove `key`, returning its value if it was present.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let idx = *self.map.get(key)?;
        Some(self.remove_at(idx).1)
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Snapshot every entry. Does not affect recency.
    pub fn dump(&self) -> HashMap<K, V>
    where
        V: Clone,
    {
        self.nodes
            .iter()
            .map(|n| (n.key.clone(), n.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ── List maintenance ────────────────────────────────────────────

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.detach(idx);
            self.attach_front(idx);
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => self.tail = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn attach_front(&mut self, idx: usize) {
        self.nodes[idx].prev = None;
        self.nodes[idx].next = self.head;
        match self.head {
            Some(h) => self.nodes[h].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn remove_at(&mut self, idx: usize) -> (K, V) {
        self.detach(idx);
        let node = self.nodes.swap_remove(idx);
        self.map.remove(&node.key);

        // The former last slot now lives at `idx`; repoint its neighbours.
        if idx < self.nodes.len() {
            let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
            match prev {
                Some(p) => self.nodes[p].next = Some(idx),
                None => self.head = Some(idx),
            }
            match next {
                Some(n) => self.nodes[n].prev = Some(idx),
                None => self.tail = Some(idx),
            }
            if let Some(slot) = self.map.get_mut(&self.nodes[idx].key) {
                *slot = idx;
            }
        }

        (node.key, node.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(3);
        for i in 0..4 {
            cache.put(i, i * 10);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get(&0).is_none());
        assert_eq!(cache.get(&3), Some(&30));
    }

    #[test]
    fn put_returns_evicted_entry() {
        let mut cache = LruCache::new(2);
        assert!(cache.put("a", 1).is_none());
        assert!(cache.put("b", 2).is_none());
        assert_eq!(cache.put("c", 3), Some(("a", 1)));
    }

    #[test]
    fn get_protects_from_eviction() {
        let mut cache = LruCache::new(3);
        cache.put(1, "one");
        cache.put(2, "two");
        cache.put(3, "three");
        cache.get(&1);
        cache.put(4, "four");
        assert!(cache.get(&2).is_none());
        assert_eq!(cache.get(&1), Some(&"one"));
    }

    #[test]
    fn find_promotes_match() {
        let mut cache = LruCache::new(2);
        cache.put("x", 1);
        cache.put("y", 2);
        let (key, value) = cache.find(|_, v| *v == 1).unwrap();
        assert_eq!((*key, *value), ("x", 1));
        cache.put("z", 3);
        assert!(cache.get(&"y").is_none());
        assert!(cache.get(&"x").is_some());
        assert!(cache.find(|_, v| *v == 42).is_none());
    }

    #[test]
    fn put_updates_existing_key() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert!(cache.put("a", 10).is_none());
        cache.put("c", 3);
        assert_eq!(cache.get(&"a"), Some(&10));
        assert!(cache.get(&"b").is_none());
    }

    #[test]
    fn delete_clear_and_dump() {
        let mut cache = LruCache::new(4);
        for i in 0..4 {
            cache.put(i, i);
        }
        assert_eq!(cache.delete(&1), Some(1));
        assert_eq!(cache.delete(&1), None);

        // Links stay consistent after a swap-remove from the middle.
        cache.put(9, 9);
        cache.put(10, 10);
        assert!(cache.get(&0).is_none());

        let dump = cache.dump();
        assert_eq!(dump.len(), 4);
        assert_eq!(dump.get(&9), Some(&9));

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(&9).is_none());
    }

    #[test]
    #[should_panic(expected = "invalid capacity")]
    fn zero_capacity_panics() {
        let _ = LruCache::<u8, u8>::new(0);
    }
}
