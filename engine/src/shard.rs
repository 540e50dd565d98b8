//! Hash-partitioned copy-on-write maps.
//!
//! A [`ShardedMap`] spreads its entries over a fixed number of `Arc`
//! buckets. Cloning copies the bucket pointers, and a write copies only the
//! bucket its key hashes to, so a snapshot and its successor share every
//! bucket a seal did not touch.

use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

const SHARD_BITS: u32 = 6;
pub(crate) const SHARDS: usize = 1 << SHARD_BITS;

fn shard_of<K: Hash>(key: &K) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() >> (u64::BITS - SHARD_BITS)) as usize
}

#[derive(Debug, Clone)]
pub(crate) struct ShardedMap<K, V> {
    /// Empty until the first write, then exactly `SHARDS` long
    shards: Vec<Arc<FxHashMap<K, V>>>,
}

impl<K, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self { shards: Vec::new() }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> ShardedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> {
        self.shards.get(shard_of(key))?.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Mutable access to an existing entry. A missing key copies nothing.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.contains_key(key) {
            return None;
        }
        self.shard_mut(shard_of(key)).get_mut(key)
    }

    pub fn get_or_default(&mut self, key: K) -> &mut V
    where
        V: Default,
    {
        self.shard_mut(shard_of(&key)).entry(key).or_default()
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.shard_mut(shard_of(&key)).insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        if !self.contains_key(key) {
            return None;
        }
        self.shard_mut(shard_of(key)).remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// Number of allocated buckets: zero or `SHARDS`.
    pub fn bucket_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of buckets still shared with `other`.
    pub fn shared_with(&self, other: &Self) -> usize {
        self.shards
            .iter()
            .zip(&other.shards)
            .filter(|(a, b)| Arc::ptr_eq(a, b))
            .count()
    }

    fn shard_mut(&mut self, index: usize) -> &mut FxHashMap<K, V> {
        if self.shards.is_empty() {
            self.shards = (0..SHARDS).map(|_| Arc::default()).collect();
        }
        Arc::make_mut(&mut self.shards[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_operations() {
        let mut map: ShardedMap<u32, String> = ShardedMap::default();
        assert_eq!(map.bucket_count(), 0);
        assert_eq!(map.get(&1), None);

        map.insert(1, "core".into());
        map.get_or_default(2).push_str("app");
        if let Some(value) = map.get_mut(&1) {
            value.push_str("-lib");
        }

        assert_eq!(map.get(&1).map(String::as_str), Some("core-lib"));
        assert_eq!(map.get(&2).map(String::as_str), Some("app"));
        assert_eq!(map.len(), 2);
        assert_eq!(map.bucket_count(), SHARDS);

        assert_eq!(map.remove(&1), Some("core-lib".into()));
        assert_eq!(map.remove(&1), None);
        assert!(!map.contains_key(&1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn one_write_copies_one_bucket() {
        let mut map: ShardedMap<u32, u32> = ShardedMap::default();
        for key in 0..20_000 {
            map.insert(key, key);
        }
        let base = map.clone();
        assert_eq!(map.shared_with(&base), SHARDS);

        map.insert(20_000, 0);

        assert_eq!(map.shared_with(&base), SHARDS - 1);
        assert_eq!(base.len(), 20_000);
        assert_eq!(map.len(), 20_001);
        assert_eq!(base.get(&20_000), None);
    }

    #[test]
    fn misses_copy_nothing() {
        let mut map: ShardedMap<u32, u32> = ShardedMap::default();
        map.insert(7, 7);
        let base = map.clone();

        assert_eq!(map.get_mut(&8), None);
        assert_eq!(map.remove(&8), None);

        assert_eq!(map.shared_with(&base), SHARDS);
    }

    #[test]
    fn keys_spread_over_buckets() {
        let used: std::collections::BTreeSet<usize> = (0u32..1_000).map(|key| shard_of(&key)).collect();
        assert!(used.len() > SHARDS / 2);
    }
}
