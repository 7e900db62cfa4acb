use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Called with an entry pushed out by a newer one.
pub type EvictHook<K, V> = Box<dyn FnMut(K, V) + Send>;

/// Fixed capacity LRU map with an eviction side effect.
///
/// `get` promotes an entry to most recently used. Inserting a new key into a
/// full cache removes the least recently used entry and hands it to the hook
/// before `put` returns. Replacing the value of an existing key, or calling
/// [`remove`](Self::remove), does not invoke the hook.
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    on_evict: Option<EvictHook<K, V>>,
}

impl<K: Hash + Eq, V> BoundedCache<K, V> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            on_evict: None,
        }
    }

    pub fn with_evict_hook(capacity: usize, hook: impl FnMut(K, V) + Send + 'static) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(Box::new(hook));
        cache
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Look up without touching the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn put(&mut self, key: K, value: V) {
        if self.entries.contains(&key) {
            self.entries.put(key, value);
            return;
        }
        if let Some((old_key, old_value)) = self.entries.push(key, value) {
            if let Some(hook) = self.on_evict.as_mut() {
                hook(old_key, old_value);
            }
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }
}
