//! A fixed-capacity hash map with chained buckets, whose entries live in a [`Slab`]. There is
//!  no rehashing and no resizing: the number of buckets equals the maximum number of entries,
//!  and `insert` fails once that number is reached.
//!
//! Keys supply their own hash via [`Fingerprint`]. Lookups compare the cached fingerprint first
//!  and then full key equality, so colliding keys are handled correctly.

use crate::buffers::list::List;
use crate::buffers::slab::{Slab, SlabHandle};
use tracing::trace;

pub trait Fingerprint {
    fn fingerprint(&self) -> u32;
}

/// Byte-mixing hash over a key's canonical byte image
pub fn fingerprint_bytes(bytes: &[u8]) -> u32 {
    let mut h: u32 = 31;
    for &b in bytes {
        h = h.wrapping_mul(54059) ^ (b as u32).wrapping_mul(76963);
    }
    h
}

struct MapEntry<K, V> {
    hash: u32,
    entry: Option<(K, V)>,
}

impl<K, V> Default for MapEntry<K, V> {
    fn default() -> Self {
        MapEntry {
            hash: 0,
            entry: None,
        }
    }
}

pub struct FingerprintMap<K, V> {
    slab: Slab<MapEntry<K, V>>,
    buckets: Vec<List<MapEntry<K, V>>>,
}

impl<K: Fingerprint + Eq, V> FingerprintMap<K, V> {
    pub fn with_capacity(capacity: usize) -> FingerprintMap<K, V> {
        let num_buckets = capacity.max(1);
        FingerprintMap {
            slab: Slab::with_capacity(capacity),
            buckets: (0..num_buckets).map(|_| List::new()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slab.capacity()
    }

    pub fn len(&self) -> usize {
        self.slab.num_secured()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.slab.num_free() == 0
    }

    fn bucket_index(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }

    fn find_handle(&self, key: &K, hash: u32) -> Option<SlabHandle> {
        let bucket = &self.buckets[self.bucket_index(hash)];
        bucket.iter(&self.slab)
            .find(|&h| match self.slab.get(h) {
                Some(MapEntry { hash: entry_hash, entry: Some((k, _)) }) => *entry_hash == hash && k == key,
                _ => false,
            })
    }

    pub fn find(&self, key: &K) -> Option<&V> {
        let handle = self.find_handle(key, key.fingerprint())?;
        self.slab.get(handle)?
            .entry.as_ref()
            .map(|(_, v)| v)
    }

    /// Insert or replace the value for `key`. Returns `false` without modifying the map if the
    ///  key is new and the map is at capacity.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let hash = key.fingerprint();
        if let Some(handle) = self.find_handle(&key, hash) {
            if let Some(entry) = self.slab.get_mut(handle) {
                entry.entry = Some((key, value));
                return true;
            }
        }
        self.insert_new(key, hash, value).is_some()
    }

    fn insert_new(&mut self, key: K, hash: u32, value: V) -> Option<SlabHandle> {
        let Some(handle) = self.slab.secure() else {
            trace!("fingerprint map is at capacity ({})", self.capacity());
            return None;
        };

        if let Some(entry) = self.slab.get_mut(handle) {
            entry.hash = hash;
            entry.entry = Some((key, value));
        }

        let bucket_index = self.bucket_index(hash);
        self.buckets[bucket_index].push(&mut self.slab, handle);
        Some(handle)
    }

    /// Look up `key`, inserting the result of `f` if it is not present. Returns `None` if the
    ///  key is new and the map is full - `f` is not called in that case.
    pub fn find_or_insert_with(&mut self, key: K, f: impl FnOnce() -> V) -> Option<&mut V> {
        let hash = key.fingerprint();
        let handle = match self.find_handle(&key, hash) {
            Some(handle) => handle,
            None => {
                if self.is_full() {
                    return None;
                }
                self.insert_new(key, hash, f())?
            }
        };

        self.slab.get_mut(handle)?
            .entry.as_mut()
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let hash = key.fingerprint();
        let handle = self.find_handle(key, hash)?;

        let bucket_index = self.bucket_index(hash);
        self.buckets[bucket_index].remove(&mut self.slab, handle);

        let removed = self.slab.get_mut(handle)
            .and_then(|entry| entry.entry.take())
            .map(|(_, v)| v);
        self.slab.free(handle);
        removed
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.buckets.iter()
            .flat_map(move |bucket| bucket.iter(&self.slab))
            .filter_map(move |h| self.slab.get(h))
            .filter_map(|entry| entry.entry.as_ref().map(|(_, v)| v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// key with a controllable fingerprint, to force collisions
    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestKey {
        id: u32,
        fingerprint: u32,
    }

    impl Fingerprint for TestKey {
        fn fingerprint(&self) -> u32 {
            self.fingerprint
        }
    }

    fn key(id: u32) -> TestKey {
        TestKey { id, fingerprint: fingerprint_bytes(&id.to_be_bytes()) }
    }

    fn colliding(id: u32) -> TestKey {
        TestKey { id, fingerprint: 7 }
    }

    #[test]
    fn test_insert_find_remove() {
        let mut map = FingerprintMap::with_capacity(4);
        assert!(map.insert(key(1), "a"));
        assert!(map.insert(key(2), "b"));

        assert_eq!(map.find(&key(1)), Some(&"a"));
        assert_eq!(map.find(&key(2)), Some(&"b"));
        assert_eq!(map.find(&key(3)), None);
        assert_eq!(map.len(), 2);

        assert_eq!(map.remove(&key(1)), Some("a"));
        assert_eq!(map.remove(&key(1)), None);
        assert_eq!(map.find(&key(1)), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_insert_replaces() {
        let mut map = FingerprintMap::with_capacity(1);
        assert!(map.insert(key(1), 1));
        assert!(map.insert(key(1), 2));
        assert_eq!(map.find(&key(1)), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[rstest]
    #[case::zero(0)]
    #[case::one(1)]
    #[case::several(5)]
    fn test_capacity_is_fixed(#[case] capacity: u32) {
        let mut map = FingerprintMap::with_capacity(capacity as usize);
        for i in 0..capacity {
            assert!(map.insert(key(i), i));
        }
        assert!(map.is_full());
        assert!(!map.insert(key(capacity), capacity));
        assert_eq!(map.find(&key(capacity)), None);
        assert_eq!(map.len(), capacity as usize);

        if capacity > 0 {
            map.remove(&key(0));
            assert!(map.insert(key(capacity), capacity));
        }
    }

    #[test]
    fn test_collisions_compare_full_key() {
        let mut map = FingerprintMap::with_capacity(3);
        assert!(map.insert(colliding(1), 10));
        assert!(map.insert(colliding(2), 20));
        assert!(map.insert(colliding(3), 30));

        assert_eq!(map.find(&colliding(2)), Some(&20));
        assert_eq!(map.remove(&colliding(2)), Some(20));
        assert_eq!(map.find(&colliding(1)), Some(&10));
        assert_eq!(map.find(&colliding(2)), None);
        assert_eq!(map.find(&colliding(3)), Some(&30));
    }

    #[test]
    fn test_find_or_insert_with() {
        let mut map = FingerprintMap::with_capacity(1);

        *map.find_or_insert_with(key(1), || 5).unwrap() += 1;
        assert_eq!(map.find(&key(1)), Some(&6));

        let mut called = false;
        assert_eq!(map.find_or_insert_with(key(1), || { called = true; 0 }), Some(&mut 6));
        assert!(!called);

        assert!(map.find_or_insert_with(key(2), || { called = true; 0 }).is_none());
        assert!(!called);
    }

    #[test]
    fn test_values() {
        let mut map = FingerprintMap::with_capacity(4);
        map.insert(key(1), 1);
        map.insert(key(2), 2);
        map.insert(colliding(3), 3);
        map.insert(key(2), 20);

        let mut values = map.values().cloned().collect::<Vec<_>>();
        values.sort();
        assert_eq!(values, vec![1, 3, 20]);
    }

    #[test]
    fn test_fingerprint_bytes() {
        assert_eq!(fingerprint_bytes(&[]), 31);
        assert_eq!(fingerprint_bytes(&[1, 2, 3]), fingerprint_bytes(&[1, 2, 3]));
        assert_ne!(fingerprint_bytes(&[1, 2]), fingerprint_bytes(&[2, 1]));
        assert_ne!(fingerprint_bytes(&[0]), fingerprint_bytes(&[0, 0]));
    }
}
