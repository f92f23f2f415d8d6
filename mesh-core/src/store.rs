//! Ordered associative store (C2): a balanced tree keyed by `Ord`, with an
//! optional deleter callback fired on removal. The legacy implementation is
//! a hand-rolled AVL/splay tree (`avl_tree_t`); Rust's `BTreeMap` already is
//! one, so this module is a thin wrapper that adds the deleter-callback
//! semantics and ordered-iteration helpers C3's indexes build on.

use std::collections::BTreeMap;

/// An ordered map that runs `on_delete` for every value it removes, whether
/// via `remove`, `reinsert` displacing an old entry, or `clear`. Mirrors the
/// legacy store's deleter-callback contract so index maintenance (e.g.
/// freeing a `Connection`'s crypto state) cannot be forgotten at a removal
/// site.
pub struct OrderedStore<K: Ord, V> {
    tree: BTreeMap<K, V>,
    on_delete: Option<Box<dyn Fn(&K, V) + Send + Sync>>,
}

impl<K: Ord, V> OrderedStore<K, V> {
    pub fn new() -> Self {
        Self { tree: BTreeMap::new(), on_delete: None }
    }

    pub fn with_deleter<F>(deleter: F) -> Self
    where
        F: Fn(&K, V) + Send + Sync + 'static,
    {
        Self { tree: BTreeMap::new(), on_delete: Some(Box::new(deleter)) }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.tree.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.tree.get_mut(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.tree.contains_key(key)
    }

    /// Insert `value` at `key`, returning the old value if the key was
    /// already present. The deleter only fires on `remove`/`clear` — a
    /// reinsert is a replace, not a delete, in the legacy tree's semantics.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.tree.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.tree.remove(key)?;
        if let Some(cb) = &self.on_delete {
            cb(key, removed);
            None
        } else {
            Some(removed)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.tree.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.tree.iter_mut()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.tree.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.tree.keys()
    }

    pub fn clear(&mut self) {
        if let Some(cb) = &self.on_delete {
            let drained: Vec<(K, V)> = std::mem::take(&mut self.tree).into_iter().collect();
            for (k, v) in drained {
                cb(&k, v);
            }
        } else {
            self.tree.clear();
        }
    }
}

impl<K: Ord, V> Default for OrderedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn remove_without_deleter_returns_value() {
        let mut s: OrderedStore<u32, &'static str> = OrderedStore::new();
        s.insert(1, "one");
        assert_eq!(s.remove(&1), Some("one"));
        assert_eq!(s.remove(&1), None);
    }

    #[test]
    fn remove_with_deleter_fires_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let mut s: OrderedStore<u32, u32> = OrderedStore::with_deleter(move |_k, _v| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        s.insert(1, 100);
        s.insert(2, 200);
        assert_eq!(s.remove(&1), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        s.clear();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ordered_iteration_is_key_sorted() {
        let mut s: OrderedStore<i32, ()> = OrderedStore::new();
        for k in [5, 1, 3, 2, 4] {
            s.insert(k, ());
        }
        let keys: Vec<i32> = s.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }
}
