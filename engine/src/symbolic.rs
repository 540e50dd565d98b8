//! Symbolic reference index.
//!
//! Tracks which records mention a [`SymbolicId`] in a soft-reference field
//! (referrers) and which records own one through their type's symbolic key
//! (owners). Lookups in both directions avoid scanning the record store
//! when a key is renamed or resolved.

use crate::{shard::ShardedMap, Handle, SymbolicId};
use std::collections::BTreeSet;

/// Reverse index from symbolic ids to the records mentioning or owning them.
///
/// Every map is split into hashed buckets, so indexing one record copies a
/// couple of buckets rather than the whole index.
#[derive(Debug, Clone, Default)]
pub struct SymbolicIndex {
    referrers: ShardedMap<SymbolicId, BTreeSet<Handle>>,
    by_referrer: ShardedMap<Handle, BTreeSet<SymbolicId>>,
    owners: ShardedMap<SymbolicId, BTreeSet<Handle>>,
}

impl SymbolicIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `referrer` mentions `key`.
    pub fn index(&mut self, referrer: Handle, key: SymbolicId) {
        self.by_referrer
            .get_or_default(referrer)
            .insert(key.clone());
        self.referrers.get_or_default(key).insert(referrer);
    }

    /// Forget that `referrer` mentions `key`.
    pub fn remove(&mut self, referrer: Handle, key: &SymbolicId) {
        if !self.refs_of(referrer).any(|k| k == key) {
            return;
        }
        if drop_member(&mut self.by_referrer, &referrer, key) {
            self.by_referrer.remove(&referrer);
        }
        if drop_member(&mut self.referrers, key, &referrer) {
            self.referrers.remove(key);
        }
    }

    /// Replace the indexed keys of `referrer` with `keys`.
    pub fn reindex(&mut self, referrer: Handle, keys: &[SymbolicId]) {
        let current: Vec<SymbolicId> = self.refs_of(referrer).cloned().collect();
        if current.as_slice() == keys {
            return;
        }
        for key in current.iter().filter(|k| !keys.contains(k)) {
            self.remove(referrer, key);
        }
        for key in keys.iter().filter(|k| !current.contains(k)) {
            self.index(referrer, key.clone());
        }
    }

    /// Drop every entry held by `referrer`.
    pub fn remove_referrer(&mut self, referrer: Handle) {
        self.reindex(referrer, &[]);
    }

    /// Records mentioning `key`, in handle order.
    pub fn referrers(&self, key: &SymbolicId) -> impl Iterator<Item = Handle> + '_ {
        self.referrers
            .get(key)
            .into_iter()
            .flat_map(|handles| handles.iter().copied())
    }

    /// Keys mentioned by `referrer`, in key order.
    pub fn refs_of(&self, referrer: Handle) -> impl Iterator<Item = &SymbolicId> + '_ {
        self.by_referrer
            .get(&referrer)
            .into_iter()
            .flat_map(|keys| keys.iter())
    }

    /// Move every referrer of `from` under `to`, returning the moved handles.
    ///
    /// Renaming a key onto itself, or a key nobody mentions, does nothing.
    /// The records themselves are rewritten by the caller.
    pub fn rename(&mut self, from: &SymbolicId, to: &SymbolicId) -> Vec<Handle> {
        if from == to {
            return Vec::new();
        }
        let moved: Vec<Handle> = self.referrers(from).collect();
        for referrer in &moved {
            self.remove(*referrer, from);
            self.index(*referrer, to.clone());
        }
        moved
    }

    /// Register `owner` as owning `key`.
    pub fn set_owner(&mut self, key: SymbolicId, owner: Handle) {
        self.owners.get_or_default(key).insert(owner);
    }

    pub fn remove_owner(&mut self, key: &SymbolicId, owner: Handle) {
        if !self.owners.get(key).is_some_and(|o| o.contains(&owner)) {
            return;
        }
        if drop_member(&mut self.owners, key, &owner) {
            self.owners.remove(key);
        }
    }

    /// Every record owning `key`. More than one only in an unsealed builder.
    pub fn owners(&self, key: &SymbolicId) -> impl Iterator<Item = Handle> + '_ {
        self.owners
            .get(key)
            .into_iter()
            .flat_map(|handles| handles.iter().copied())
    }

    /// The record owning `key`.
    pub fn resolve(&self, key: &SymbolicId) -> Option<Handle> {
        self.owners(key).next()
    }

    /// Number of distinct keys that have referrers.
    pub fn key_count(&self) -> usize {
        self.referrers.len()
    }

    /// Buckets still shared with `other`, and the number allocated here.
    pub fn shared_buckets(&self, other: &SymbolicIndex) -> (usize, usize) {
        let shared = self.referrers.shared_with(&other.referrers)
            + self.by_referrer.shared_with(&other.by_referrer)
            + self.owners.shared_with(&other.owners);
        let total = self.referrers.bucket_count()
            + self.by_referrer.bucket_count()
            + self.owners.bucket_count();
        (shared, total)
    }
}

/// Remove `member` from the set under `key`; true when the set is left empty.
fn drop_member<K, T>(map: &mut ShardedMap<K, BTreeSet<T>>, key: &K, member: &T) -> bool
where
    K: std::hash::Hash + Eq + Clone,
    T: Ord + Clone,
{
    match map.get_mut(key) {
        Some(set) => {
            set.remove(member);
            set.is_empty()
        }
        None => false,
    }
}
