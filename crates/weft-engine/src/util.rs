//! Small shared pieces with no better home.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

/// A size-bounded FIFO cache. Eviction is by insertion order, which is enough
/// for the per-query graph and invocation caches where recency matters less
/// than an explicit memory bound. A capacity of zero disables caching.
pub struct BoundedCache<K, V> {
    inner: Mutex<BoundedCacheInner<K, V>>,
    capacity: usize,
}

struct BoundedCacheInner<K, V> {
    entries: HashMap<K, V, ahash::RandomState>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BoundedCacheInner {
                entries: HashMap::default(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), value).is_none() {
            inner.order.push_back(key);
            while inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.entries.remove(&evicted);
                }
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
