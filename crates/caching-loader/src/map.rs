use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};

/// The backing store of a [`CachingLoader`](crate::CachingLoader).
///
/// Maps a derived cache key to the handle that was published for it. The loader only ever keeps
/// one handle per key, and takes care of all the synchronization; implementations are plain
/// single-owner containers.
///
/// Implementations are free to refuse entries, for example to enforce a capacity, by panicking
/// from [`insert`](CacheMap::insert). The loader does not mask such panics.
pub trait CacheMap<K, V> {
    /// Returns the entry for `key`, if any.
    fn get(&self, key: &K) -> Option<&V>;

    /// Inserts an entry, returning the previous one for the same key.
    fn insert(&mut self, key: K, value: V) -> Option<V>;

    /// Removes and returns the entry for `key`, if any.
    fn remove(&mut self, key: &K) -> Option<V>;

    /// Removes all entries.
    fn clear(&mut self);

    /// The number of entries.
    fn len(&self) -> usize;

    /// Whether there are no entries.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V, S> CacheMap<K, V> for HashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    fn get(&self, key: &K) -> Option<&V> {
        HashMap::get(self, key)
    }

    fn insert(&mut self, key: K, value: V) -> Option<V> {
        HashMap::insert(self, key, value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        HashMap::remove(self, key)
    }

    fn clear(&mut self) {
        HashMap::clear(self)
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }
}

impl<K, V> CacheMap<K, V> for BTreeMap<K, V>
where
    K: Ord,
{
    fn get(&self, key: &K) -> Option<&V> {
        BTreeMap::get(self, key)
    }

    fn insert(&mut self, key: K, value: V) -> Option<V> {
        BTreeMap::insert(self, key, value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        BTreeMap::remove(self, key)
    }

    fn clear(&mut self) {
        BTreeMap::clear(self)
    }

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
}
