//! O(1) LRU cache with age-based bulk eviction.
//!
//! A hash index over a slab-backed doubly-linked list, ordered oldest (head)
//! to newest (tail). Every `get`/`put` touch relocates the entry to the tail
//! and refreshes its timestamp, so the list is timestamp-ordered by
//! construction and `evict_before` only ever scans the expired prefix.
//!
//! The UDP engine stores each NAT session under two keys (client address and
//! ephemeral local address), which is why `put` hands evicted values back to
//! the caller instead of dropping them: an evicted session still has cleanup
//! to run against its sibling key.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Instant;

const NIL: usize = usize::MAX;

struct Entry<K, V> {
    key: K,
    value: V,
    stamp: Instant,
    prev: usize,
    next: usize,
}

pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    /// Look up a key; a hit counts as a touch (entry moves to the tail and
    /// its timestamp is refreshed).
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.touch(idx);
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// Look up a key without touching recency or timestamp.
    pub fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.slots[idx].as_ref().map(|e| &e.value)
    }

    /// Insert or update.
    ///
    /// An existing key is updated in place and touched; nothing is evicted on
    /// that path. A new key at capacity first evicts the oldest entry, which
    /// is returned so the caller can run its cleanup.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(entry) = self.slots[idx].as_mut() {
                entry.value = value;
            }
            self.touch(idx);
            return None;
        }
        let evicted = if self.map.len() >= self.capacity {
            self.evict_one()
        } else {
            None
        };
        let entry = Entry {
            key: key.clone(),
            value,
            stamp: Instant::now(),
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_tail(idx);
        evicted
    }

    /// Unlink and return the value for `key`, if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let entry = self.slots[idx].take()?;
        self.free.push(idx);
        Some(entry.value)
    }

    /// Evict every entry whose timestamp is strictly older than `watermark`,
    /// oldest first. Stops at the first entry at or past the watermark.
    pub fn evict_before(&mut self, watermark: Instant) -> Vec<V> {
        let mut evicted = Vec::new();
        while let Some(stamp) = self.oldest_timestamp() {
            if stamp >= watermark {
                break;
            }
            if let Some(v) = self.evict_one() {
                evicted.push(v);
            }
        }
        evicted
    }

    /// Timestamp of the least-recently-touched entry.
    pub fn oldest_timestamp(&self) -> Option<Instant> {
        if self.head == NIL {
            return None;
        }
        self.slots[self.head].as_ref().map(|e| e.stamp)
    }

    /// Remove and return the oldest entry's value.
    pub fn evict_one(&mut self) -> Option<V> {
        if self.head == NIL {
            return None;
        }
        let key = self.slots[self.head].as_ref().map(|e| e.key.clone())?;
        self.remove(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn touch(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(entry) = self.slots[idx].as_mut() {
            entry.stamp = Instant::now();
        }
        self.push_tail(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slots[idx].as_ref() {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        if prev != NIL {
            if let Some(p) = self.slots[prev].as_mut() {
                p.next = next;
            }
        } else {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.slots[next].as_mut() {
                n.prev = prev;
            }
        } else {
            self.tail = prev;
        }
        if let Some(e) = self.slots[idx].as_mut() {
            e.prev = NIL;
            e.next = NIL;
        }
    }

    fn push_tail(&mut self, idx: usize) {
        let old_tail = self.tail;
        if let Some(e) = self.slots[idx].as_mut() {
            e.prev = old_tail;
            e.next = NIL;
        }
        if old_tail != NIL {
            if let Some(t) = self.slots[old_tail].as_mut() {
                t.next = idx;
            }
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }

    /// Walk the linked list, oldest to newest. Diagnostics and invariants.
    fn keys_oldest_first(&self) -> Vec<&K> {
        let mut out = Vec::with_capacity(self.map.len());
        let mut cur = self.head;
        while cur != NIL {
            if let Some(e) = self.slots[cur].as_ref() {
                out.push(&e.key);
                cur = e.next;
            } else {
                break;
            }
        }
        out
    }
}

impl<K: Eq + Hash + Clone + fmt::Debug, V: fmt::Debug> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        let mut cur = self.head;
        while cur != NIL {
            if let Some(e) = self.slots[cur].as_ref() {
                list.entry(&(&e.key, &e.value));
                cur = e.next;
            } else {
                break;
            }
        }
        list.finish()
    }
}
