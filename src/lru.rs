//! Bounded least-recently-used map.
//!
//! Index-linked list over a slab of entries. Used by the table cache's
//! recency tier and by each buffer's blob cache.

use std::collections::HashMap;
use std::hash::Hash;

struct Slot<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Slot<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity.min(1024)),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity, evicting the oldest entries if it shrinks.
    ///
    /// Returns the evicted entries, oldest first.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<(K, V)> {
        self.capacity = capacity;
        let mut evicted = Vec::new();
        while self.map.len() > self.capacity {
            match self.pop_oldest() {
                Some(e) => evicted.push(e),
                None => break,
            }
        }
        evicted
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.move_to_front(index);
        self.slots[index].as_ref().map(|s| &s.value)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.slots[index].as_ref().map(|s| &s.value)
    }

    /// Insert or refresh an entry. Returns entries evicted to make room.
    pub fn put(&mut self, key: K, value: V) -> Vec<(K, V)> {
        if let Some(&index) = self.map.get(&key) {
            if let Some(slot) = &mut self.slots[index] {
                slot.value = value;
            }
            self.move_to_front(index);
            return Vec::new();
        }
        if self.capacity == 0 {
            return vec![(key, value)];
        }
        let mut evicted = Vec::new();
        while self.map.len() >= self.capacity {
            match self.pop_oldest() {
                Some(e) => evicted.push(e),
                None => break,
            }
        }
        let index = self.allocate(key.clone(), value);
        self.map.insert(key, index);
        self.push_front(index);
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.map.remove(key)?;
        self.unlink(index);
        let slot = self.slots[index].take();
        self.free.push(index);
        slot.map(|s| s.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop everything. Returns the number of entries removed.
    pub fn clear(&mut self) -> usize {
        let n = self.map.len();
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        n
    }

    /// Remove and return the least recently used entry.
    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        let index = self.tail?;
        let key = self.slots[index].as_ref()?.key.clone();
        let value = self.remove(&key)?;
        Some((key, value))
    }

    fn allocate(&mut self, key: K, value: V) -> usize {
        let slot = Slot {
            key,
            value,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn push_front(&mut self, index: usize) {
        if let Some(slot) = &mut self.slots[index] {
            slot.prev = None;
            slot.next = self.head;
        }
        if let Some(old) = self.head {
            if let Some(slot) = &mut self.slots[old] {
                slot.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match &self.slots[index] {
            Some(slot) => (slot.prev, slot.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(slot) = &mut self.slots[p] {
                    slot.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(slot) = &mut self.slots[n] {
                    slot.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_follows_recency() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.get(&"a");

        let evicted = cache.put("c", 3);
        assert_eq!(evicted, vec![("b", 2)]);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let mut cache = LruCache::new(2);
        cache.put(1, "x");
        cache.put(2, "y");
        assert_eq!(cache.peek(&1), Some(&"x"));
        assert_eq!(cache.put(3, "z"), vec![(1, "x")]);
    }

    #[test]
    fn test_shrink_capacity() {
        let mut cache = LruCache::new(4);
        for i in 0..4 {
            cache.put(i, i * 10);
        }
        let evicted = cache.set_capacity(1);
        assert_eq!(evicted, vec![(0, 0), (1, 10), (2, 20)]);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_zero_capacity_rejects() {
        let mut cache = LruCache::new(0);
        assert_eq!(cache.put("a", 1), vec![("a", 1)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reuses_slots_after_remove() {
        let mut cache = LruCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        cache.put("c", 3);
        assert_eq!(cache.pop_oldest(), Some(("b", 2)));
        assert_eq!(cache.pop_oldest(), Some(("c", 3)));
        assert_eq!(cache.pop_oldest(), None);
    }
}
