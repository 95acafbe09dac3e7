//! TTL-indexed LRU map for NAT session state.
//!
//! Recency order is kept in an intrusive doubly-linked list over a slab
//! (back = most recently used). Expired entries at the front are evicted
//! after every mutation; `Get` on an expired entry deletes it and misses.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    /// 过期时刻（epoch 毫秒）；0 表示永不过期
    expires: i64,
    prev: usize,
    next: usize,
}

struct Inner<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_age: i64,
    update_age_on_get: bool,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// `max_age` is the entry TTL in seconds; 0 disables expiry.
    pub fn new(max_age: i64, update_age_on_get: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
            max_age,
            update_age_on_get,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = now_millis();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => return None,
        };
        let idx = *inner.map.get(key)?;
        let expires = inner.nodes[idx].as_ref().map(|n| n.expires)?;
        if self.max_age > 0 && expires <= now {
            inner.remove_node(idx);
            inner.evict_expired(now);
            return None;
        }
        inner.move_to_back(idx);
        let node = inner.nodes[idx].as_mut()?;
        if self.max_age > 0 && self.update_age_on_get {
            node.expires = now + self.max_age * 1000;
        }
        Some(node.value.clone())
    }

    /// Insert or update. Existing entries are updated in place and
    /// refreshed, never duplicated.
    pub fn insert(&self, key: K, value: V) {
        let now = now_millis();
        let expires = if self.max_age > 0 {
            now + self.max_age * 1000
        } else {
            0
        };
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => return,
        };
        if let Some(&idx) = inner.map.get(&key) {
            inner.move_to_back(idx);
            if let Some(node) = inner.nodes[idx].as_mut() {
                node.value = value;
                node.expires = expires;
            }
        } else {
            inner.push_back(key, value, expires);
        }
        inner.evict_expired(now);
    }

    pub fn remove(&self, key: &K) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(_poisoned) => return,
        };
        if let Some(&idx) = inner.map.get(key) {
            inner.remove_node(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Inner<K, V>
where
    K: Hash + Eq + Clone,
{
    fn push_back(&mut self, key: K, value: V, expires: i64) {
        let node = Node {
            key: key.clone(),
            value,
            expires,
            prev: self.tail,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        if self.tail != NIL {
            if let Some(tail) = self.nodes[self.tail].as_mut() {
                tail.next = idx;
            }
        } else {
            self.head = idx;
        }
        self.tail = idx;
        self.map.insert(key, idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        if prev != NIL {
            if let Some(p) = self.nodes[prev].as_mut() {
                p.next = next;
            }
        } else {
            self.head = next;
        }
        if next != NIL {
            if let Some(n) = self.nodes[next].as_mut() {
                n.prev = prev;
            }
        } else {
            self.tail = prev;
        }
    }

    fn move_to_back(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = NIL;
        }
        if tail != NIL {
            if let Some(t) = self.nodes[tail].as_mut() {
                t.next = idx;
            }
        } else {
            self.head = idx;
        }
        self.tail = idx;
    }

    fn remove_node(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(node) = self.nodes[idx].take() {
            self.map.remove(&node.key);
        }
        self.free.push(idx);
    }

    fn evict_expired(&mut self, now: i64) {
        loop {
            let head = self.head;
            if head == NIL {
                return;
            }
            let expired = match self.nodes[head].as_ref() {
                Some(node) => node.expires > 0 && node.expires <= now,
                None => return,
            };
            if !expired {
                return;
            }
            self.remove_node(head);
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
