use dashmap::DashMap;
use std::borrow::Borrow;
use std::hash::Hash;

/// Lookups on `DashMap` that release the shard guard before returning.
///
/// A live `Ref` holds its shard's lock. Taking another lock (a group
/// `RwLock`, a registry shard) while one is alive would tie lock orders
/// together, so callers clone the value out instead.
pub trait DashMapExt<K, V> {
    /// Clone the value for `key`.
    fn get_cloned<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone;
}

impl<K, V> DashMapExt<K, V> for DashMap<K, V>
where
    K: Eq + Hash,
{
    fn get_cloned<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.get(key).map(|r| r.value().clone())
    }
}
