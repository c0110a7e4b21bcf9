use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::CacheKey;

/// Why an entry left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    Capacity,
    Explicit,
    Clear,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Capacity => "capacity",
            RemovalReason::Explicit => "explicit",
            RemovalReason::Clear => "clear",
        }
    }
}

/// Receives removal notifications from an [`LruIndex`].
///
/// Callbacks run synchronously while the index lock is held, so they must not
/// call back into the index that invoked them.
pub trait RemovalListener: Send + Sync {
    fn on_removed(&self, key: &CacheKey, reason: RemovalReason);

    /// Runs once after a [`LruIndex::clear`] has notified every entry.
    fn after_clear(&self) {}
}

#[derive(Debug, Default)]
pub struct NoopListener;

impl RemovalListener for NoopListener {
    fn on_removed(&self, _key: &CacheKey, _reason: RemovalReason) {}
}

/// Capacity-bounded, least-recently-used map from [`CacheKey`] to `V`.
pub struct LruIndex<V> {
    lru: Mutex<LruCache<CacheKey, V>>,
    listener: Arc<dyn RemovalListener>,
}

impl<V> fmt::Debug for LruIndex<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lru = self.lru.lock();
        f.debug_struct("LruIndex")
            .field("len", &lru.len())
            .field("capacity", &lru.cap())
            .finish()
    }
}

impl<V: Clone> LruIndex<V> {
    pub fn new(capacity: NonZeroUsize, listener: Arc<dyn RemovalListener>) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
            listener,
        }
    }

    pub fn capacity(&self) -> usize {
        self.lru.lock().cap().get()
    }

    pub fn len(&self) -> usize {
        self.lru.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.lock().is_empty()
    }

    /// Returns the entry and marks it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.lru.lock().get(key).cloned()
    }

    /// Returns the entry without touching recency.
    pub fn peek(&self, key: &CacheKey) -> Option<V> {
        self.lru.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lru.lock().contains(key)
    }

    /// Inserts or replaces `key` as most recently used. Replacing a present key
    /// is not a removal; a capacity eviction notifies the listener.
    pub fn put(&self, key: CacheKey, value: V) {
        let mut lru = self.lru.lock();
        let displaced = lru.push(key.clone(), value);
        if let Some((displaced_key, _)) = displaced
            && displaced_key != key
        {
            self.notify(&displaced_key, RemovalReason::Capacity);
        }
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.remove_if(key, |_| true)
    }

    /// Removes `key` only when `predicate` accepts the current value.
    pub fn remove_if<F>(&self, key: &CacheKey, predicate: F) -> bool
    where
        F: FnOnce(&V) -> bool,
    {
        let mut lru = self.lru.lock();
        let matches = lru.peek(key).map(predicate).unwrap_or(false);
        if matches && lru.pop(key).is_some() {
            self.notify(key, RemovalReason::Explicit);
            return true;
        }
        false
    }

    pub fn clear(&self) {
        let mut lru = self.lru.lock();
        while let Some((key, _)) = lru.pop_lru() {
            self.notify(&key, RemovalReason::Clear);
        }
        self.listener.after_clear();
    }

    /// Point-in-time copy of the index, least recently used first.
    pub fn snapshot(&self) -> Vec<(CacheKey, V)> {
        let lru = self.lru.lock();
        lru.iter()
            .rev()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn notify(&self, key: &CacheKey, reason: RemovalReason) {
        crate::metrics::record_cache_removal(reason.as_str());
        self.listener.on_removed(key, reason);
    }
}
