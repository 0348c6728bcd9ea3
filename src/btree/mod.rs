//! Persistent B+-tree over `VMCache` pages: optimistic latch-coupling on the
//! way down, pessimistic exclusive latches only where a write actually
//! lands (spec.md §3). Root is always an inner node; the empty tree still
//! has a single leaf child so levels never need a special case for depth 0.

mod node;

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::vmcache::VMCache;
use crate::cache::{ExclusiveGuard, OptResult, OptimisticGuard, Restart, SharedGuard};
use crate::error::{DbError, Result};
use crate::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};

use node::{NodeView, NodeViewMut};

type RawPage = [u8; PAGE_SIZE];

/// A fixed-width composite key (spec.md §8 "4-byte composite-key join"),
/// e.g. `CompositeKey<2>` for a two-column `(u32, u32)` index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct CompositeKey<const N: usize>(pub [u32; N]);

impl<const N: usize> CompositeKey<N> {
    pub fn new(parts: [u32; N]) -> Self {
        Self(parts)
    }
}

enum InsertOutcome<K> {
    Done,
    KeyExists,
    /// A child split and `(separator, new_right)` still needs linking into
    /// this node — or, if this node is itself full, into whichever ancestor
    /// has room (cascading up to a possible root growth).
    Propagate { separator: K, new_right: PageId },
}

pub struct BTree<K, V> {
    cache: Arc<VMCache>,
    root: AtomicU64,
    cap_inner: usize,
    cap_leaf: usize,
    grow_lock: Mutex<()>,
    next_key: AtomicU64,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> BTree<K, V>
where
    K: Copy + Ord + Send + Sync + 'static,
    V: Copy + Send + Sync + 'static,
{
    /// Creates a fresh empty tree: one inner root pointing at one empty
    /// leaf.
    pub fn create(cache: Arc<VMCache>) -> Result<Self> {
        let cap_inner = node::inner_capacity::<K>();
        let cap_leaf = node::leaf_capacity::<K, V>();
        let leaf_pid = cache.allocate_page()?;
        {
            let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(cache.clone(), leaf_pid);
            let mut nv = unsafe { NodeViewMut::<K>::new(g.data_mut().as_mut_ptr(), cap_inner, cap_leaf) };
            nv.init_leaf();
        }
        let root_pid = cache.allocate_page()?;
        {
            let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(cache.clone(), root_pid);
            let mut nv = unsafe { NodeViewMut::<K>::new(g.data_mut().as_mut_ptr(), cap_inner, cap_leaf) };
            nv.init_inner(1);
            nv.set_child(0, leaf_pid);
        }
        Ok(Self {
            cache,
            root: AtomicU64::new(root_pid),
            cap_inner,
            cap_leaf,
            grow_lock: Mutex::new(()),
            next_key: AtomicU64::new(0),
            _marker: PhantomData,
        })
    }

    /// Reopens a tree whose root page already exists (catalog reload).
    pub fn open(cache: Arc<VMCache>, root_pid: PageId) -> Self {
        Self {
            cache,
            root: AtomicU64::new(root_pid),
            cap_inner: node::inner_capacity::<K>(),
            cap_leaf: node::leaf_capacity::<K, V>(),
            grow_lock: Mutex::new(()),
            next_key: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn root_pid(&self) -> PageId {
        self.root.load(Ordering::Acquire)
    }

    fn view<'a>(data: &'a RawPage, cap_inner: usize, cap_leaf: usize) -> NodeView<'a, K> {
        unsafe { NodeView::new(data.as_ptr(), cap_inner, cap_leaf) }
    }

    fn view_mut<'a>(data: &'a mut RawPage, cap_inner: usize, cap_leaf: usize) -> NodeViewMut<'a, K> {
        unsafe { NodeViewMut::new(data.as_mut_ptr(), cap_inner, cap_leaf) }
    }

    /// Optimistic latch-coupling descent to the leaf that would hold `key`.
    fn descend_to_leaf(&self, pid: PageId, key: K) -> OptResult<PageId> {
        let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), pid);
        let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);
        if view.is_leaf() {
            opt.validate()?;
            return Ok(pid);
        }
        let idx = view.lower_bound_inner(key);
        let child = view.child(idx);
        opt.validate()?;
        self.descend_to_leaf(child, key)
    }

    fn try_lookup(&self, key: K) -> OptResult<Option<V>> {
        let leaf_pid = self.descend_to_leaf(self.root_pid(), key)?;
        let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), leaf_pid);
        let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);
        let idx = view.leaf_lower_bound(key);
        let found = idx < view.n_keys() && view.leaf_key(idx) == key;
        let result = if found { Some(view.leaf_value::<V>(idx)) } else { None };
        opt.validate()?;
        Ok(result)
    }

    /// Exact-match lookup (spec.md P-LookupRoundTrip).
    pub fn lookup(&self, key: K) -> Result<Option<V>> {
        loop {
            match self.try_lookup(key) {
                Ok(r) => return Ok(r),
                Err(Restart) => continue,
            }
        }
    }

    fn try_leftmost_leaf(&self) -> OptResult<PageId> {
        let mut pid = self.root_pid();
        loop {
            let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), pid);
            let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);
            if view.is_leaf() {
                opt.validate()?;
                return Ok(pid);
            }
            let child = view.child(0);
            opt.validate()?;
            pid = child;
        }
    }

    /// Forward iterator over the whole tree in key order (P-OrderedIter).
    pub fn iter_all(&self) -> Result<BTreeIter<K, V>> {
        loop {
            match self.try_leftmost_leaf() {
                Ok(pid) => {
                    let guard = SharedGuard::fix(self.cache.clone(), pid);
                    return Ok(BTreeIter {
                        cache: self.cache.clone(),
                        guard: Some(guard),
                        idx: 0,
                        cap_inner: self.cap_inner,
                        cap_leaf: self.cap_leaf,
                        _marker: PhantomData,
                    });
                }
                Err(Restart) => continue,
            }
        }
    }

    /// Forward iterator starting at the first key `>= key`.
    pub fn iter_from(&self, key: K) -> Result<BTreeIter<K, V>> {
        loop {
            let leaf_pid = match self.descend_to_leaf(self.root_pid(), key) {
                Ok(pid) => pid,
                Err(Restart) => continue,
            };
            let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), leaf_pid);
            let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);
            let idx = view.leaf_lower_bound(key);
            if opt.validate().is_err() {
                continue;
            }
            let guard = SharedGuard::fix(self.cache.clone(), leaf_pid);
            return Ok(BTreeIter {
                cache: self.cache.clone(),
                guard: Some(guard),
                idx,
                cap_inner: self.cap_inner,
                cap_leaf: self.cap_leaf,
                _marker: PhantomData,
            });
        }
    }

    fn insert_recursive(&self, pid: PageId, key: K, value: V) -> OptResult<InsertOutcome<K>> {
        let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), pid);
        let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);

        if view.is_leaf() {
            let idx = view.leaf_lower_bound(key);
            if idx < view.n_keys() && view.leaf_key(idx) == key {
                opt.validate()?;
                return Ok(InsertOutcome::KeyExists);
            }
            if view.n_keys() < self.cap_leaf {
                let mut excl = opt.try_upgrade()?;
                let mut nv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                let idx = nv.leaf_lower_bound(key);
                if idx < nv.n_keys() && nv.leaf_key(idx) == key {
                    return Ok(InsertOutcome::KeyExists);
                }
                nv.insert_leaf::<V>(idx, key, value);
                return Ok(InsertOutcome::Done);
            }
            // Leaf is full: split it under its own exclusive latch. No
            // parent coordination needed for the split itself, only for
            // linking the new sibling in afterwards (P-SplitPreservesKeys).
            let mut excl = opt.try_upgrade()?;
            let new_pid = self.cache.allocate_page()?;
            let mut new_excl: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), new_pid);
            let separator = {
                let (left, right) = (excl.data_mut(), new_excl.data_mut());
                let mut lv = Self::view_mut(left, self.cap_inner, self.cap_leaf);
                let mut rv = Self::view_mut(right, self.cap_inner, self.cap_leaf);
                rv.set_level(0);
                lv.split_leaf_into::<V>(&mut rv)
            };
            let target_idx = {
                let lv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                lv.leaf_lower_bound(key)
            };
            if target_idx < {
                let lv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                lv.n_keys()
            } {
                let mut lv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                lv.insert_leaf::<V>(target_idx, key, value);
            } else {
                let mut rv = Self::view_mut(new_excl.data_mut(), self.cap_inner, self.cap_leaf);
                let ridx = rv.leaf_lower_bound(key);
                rv.insert_leaf::<V>(ridx, key, value);
            }
            let mut lv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
            lv.set_next(new_pid);
            return Ok(InsertOutcome::Propagate { separator, new_right: new_pid });
        }

        let idx = view.lower_bound_inner(key);
        let child_pid = view.child(idx);
        let child_outcome = self.insert_recursive(child_pid, key, value)?;
        match child_outcome {
            InsertOutcome::Done | InsertOutcome::KeyExists => Ok(child_outcome),
            InsertOutcome::Propagate { separator, new_right } => {
                if view.n_keys() < self.cap_inner {
                    let mut excl = opt.try_upgrade()?;
                    let mut nv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                    let idx = nv.lower_bound_inner(separator);
                    nv.insert_inner(idx, separator, new_right);
                    Ok(InsertOutcome::Done)
                } else {
                    let mut excl = opt.try_upgrade()?;
                    let new_pid = self.cache.allocate_page()?;
                    let mut new_excl: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), new_pid);
                    let level_val = {
                        let v = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                        v.level()
                    };
                    let median = {
                        let mut lv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                        let mut rv = Self::view_mut(new_excl.data_mut(), self.cap_inner, self.cap_leaf);
                        rv.init_inner(level_val);
                        lv.split_inner_into(&mut rv)
                    };
                    if separator < median {
                        let mut lv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
                        let idx = lv.lower_bound_inner(separator);
                        lv.insert_inner(idx, separator, new_right);
                    } else {
                        let mut rv = Self::view_mut(new_excl.data_mut(), self.cap_inner, self.cap_leaf);
                        let idx = rv.lower_bound_inner(separator);
                        rv.insert_inner(idx, separator, new_right);
                    }
                    Ok(InsertOutcome::Propagate { separator: median, new_right: new_pid })
                }
            }
        }
    }

    fn grow_root(&self, old_root: PageId, separator: K, new_right: PageId) -> Result<()> {
        let _g = self.grow_lock.lock().unwrap();
        let level = {
            let g: SharedGuard<RawPage> = SharedGuard::fix(self.cache.clone(), old_root);
            Self::view(g.data(), self.cap_inner, self.cap_leaf).level()
        };
        let new_root_pid = self.cache.allocate_page()?;
        let mut g: ExclusiveGuard<RawPage> = ExclusiveGuard::fix(self.cache.clone(), new_root_pid);
        let mut nv = Self::view_mut(g.data_mut(), self.cap_inner, self.cap_leaf);
        nv.init_inner(level + 1);
        nv.set_child(0, old_root);
        nv.insert_inner(0, separator, new_right);
        self.root.store(new_root_pid, Ordering::Release);
        Ok(())
    }

    /// Inserts `(key, value)`; `DbError::KeyExists` if the key is already
    /// present (P-NoDup).
    pub fn insert(&self, key: K, value: V) -> Result<()> {
        loop {
            let root_pid = self.root_pid();
            match self.insert_recursive(root_pid, key, value) {
                Ok(InsertOutcome::Done) => return Ok(()),
                Ok(InsertOutcome::KeyExists) => return Err(DbError::KeyExists),
                Ok(InsertOutcome::Propagate { separator, new_right }) => {
                    self.grow_root(root_pid, separator, new_right)?;
                    return Ok(());
                }
                Err(Restart) => continue,
            }
        }
    }

    fn try_remove(&self, key: K) -> OptResult<()> {
        let leaf_pid = self.descend_to_leaf(self.root_pid(), key)?;
        let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), leaf_pid);
        let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);
        let idx = view.leaf_lower_bound(key);
        let found = idx < view.n_keys() && view.leaf_key(idx) == key;
        if !found {
            opt.validate()?;
            return Ok(());
        }
        let mut excl = opt.try_upgrade()?;
        let mut nv = Self::view_mut(excl.data_mut(), self.cap_inner, self.cap_leaf);
        let idx = nv.leaf_lower_bound(key);
        if idx < nv.n_keys() && nv.leaf_key(idx) == key {
            nv.remove_leaf::<V>(idx);
        }
        Ok(())
    }

    /// Pessimistic removal: clears the leaf slot. Merging underfull leaves
    /// back together is out of scope (spec.md Non-goals); a tree that sees
    /// heavy delete traffic simply keeps its shape.
    pub fn remove(&self, key: K) -> Result<()> {
        loop {
            match self.try_remove(key) {
                Ok(()) => return Ok(()),
                Err(Restart) => continue,
            }
        }
    }

    fn try_latch_for_update(&self, key: K) -> OptResult<Option<UpdateGuard<K, V>>> {
        let leaf_pid = self.descend_to_leaf(self.root_pid(), key)?;
        let opt: OptimisticGuard<RawPage> = OptimisticGuard::new(self.cache.clone(), leaf_pid);
        let view = Self::view(opt.data(), self.cap_inner, self.cap_leaf);
        let idx = view.leaf_lower_bound(key);
        let found = idx < view.n_keys() && view.leaf_key(idx) == key;
        if !found {
            opt.validate()?;
            return Ok(None);
        }
        let excl = opt.try_upgrade()?;
        Ok(Some(UpdateGuard {
            guard: excl,
            idx,
            cap_inner: self.cap_inner,
            cap_leaf: self.cap_leaf,
            _marker: PhantomData,
        }))
    }

    /// Acquires an exclusive latch on the leaf slot for `key`, for in-place
    /// value updates (e.g. flipping a visibility bit) without a
    /// remove-then-insert round trip. `None` if the key is absent.
    pub fn latch_for_update(&self, key: K) -> Result<Option<UpdateGuard<K, V>>> {
        loop {
            match self.try_latch_for_update(key) {
                Ok(r) => return Ok(r),
                Err(Restart) => continue,
            }
        }
    }
}

impl<V: Copy + Send + Sync + 'static> BTree<u64, V> {
    /// Appends `value` under a freshly minted key, one past the highest key
    /// this tree has handed out (RowId assignment). Walking the rightmost
    /// path on every call instead of caching a dedicated append cursor is a
    /// deliberate simplification (see DESIGN.md); correctness does not
    /// depend on the fast path.
    pub fn insert_next(&self, value: V) -> Result<u64> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.insert(key, value)?;
        Ok(key)
    }

    /// Primes the append cursor from the current contents (call once after
    /// `open` on a non-empty tree).
    pub fn recompute_next_key(&self) -> Result<()> {
        let mut pid = self.root_pid();
        loop {
            let g: SharedGuard<RawPage> = SharedGuard::fix(self.cache.clone(), pid);
            let view = Self::view(g.data(), self.cap_inner, self.cap_leaf);
            if view.is_leaf() {
                let next = if view.n_keys() == 0 { 0 } else { view.leaf_key(view.n_keys() - 1) + 1 };
                self.next_key.store(next, Ordering::Relaxed);
                return Ok(());
            }
            pid = view.child(view.n_keys());
        }
    }
}

pub struct UpdateGuard<K, V> {
    guard: ExclusiveGuard<RawPage>,
    idx: usize,
    cap_inner: usize,
    cap_leaf: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: Copy + Ord, V: Copy> UpdateGuard<K, V> {
    pub fn get(&self) -> V {
        BTree::<K, V>::view(self.guard.data(), self.cap_inner, self.cap_leaf).leaf_value::<V>(self.idx)
    }

    pub fn set(&mut self, value: V) {
        let mut nv = BTree::<K, V>::view_mut(self.guard.data_mut(), self.cap_inner, self.cap_leaf);
        nv.set_leaf_value(self.idx, value);
    }
}

pub struct BTreeIter<K, V> {
    cache: Arc<VMCache>,
    guard: Option<SharedGuard<RawPage>>,
    idx: usize,
    cap_inner: usize,
    cap_leaf: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: Copy + Ord, V: Copy> Iterator for BTreeIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let g = self.guard.as_ref()?;
            let view = BTree::<K, V>::view(g.data(), self.cap_inner, self.cap_leaf);
            if self.idx < view.n_keys() {
                let k = view.leaf_key(self.idx);
                let v = view.leaf_value::<V>(self.idx);
                self.idx += 1;
                return Some((k, v));
            }
            let next_pid = view.next();
            if next_pid == INVALID_PAGE_ID {
                self.guard = None;
                return None;
            }
            self.guard = Some(SharedGuard::fix(self.cache.clone(), next_pid));
            self.idx = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::EvictionPolicyKind;
    use crate::cache::vmcache::VMCacheConfig;

    fn cache(max_physical: usize) -> Arc<VMCache> {
        Arc::new(
            VMCache::open(VMCacheConfig {
                virtual_pages: 1 << 16,
                max_physical_pages: max_physical,
                eviction_policy: EvictionPolicyKind::Clock,
                mru_ring_capacity: 32,
                backing_file: None,
            })
            .unwrap(),
        )
    }

    #[test]
    fn lookup_round_trips_after_insert() {
        let tree: BTree<u64, u64> = BTree::create(cache(64)).unwrap();
        for k in 0..500u64 {
            tree.insert(k, k * 7).unwrap();
        }
        for k in 0..500u64 {
            assert_eq!(tree.lookup(k).unwrap(), Some(k * 7));
        }
        assert_eq!(tree.lookup(9999).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let tree: BTree<u64, u64> = BTree::create(cache(64)).unwrap();
        tree.insert(1, 100).unwrap();
        assert!(matches!(tree.insert(1, 200), Err(DbError::KeyExists)));
        assert_eq!(tree.lookup(1).unwrap(), Some(100));
    }

    #[test]
    fn iteration_is_ordered_with_no_duplicates() {
        let tree: BTree<u64, u64> = BTree::create(cache(64)).unwrap();
        let mut keys: Vec<u64> = (0..800).collect();
        // insert out of order to exercise splits from both sides
        keys.sort_by_key(|k| (k * 2654435761) % 7919);
        for &k in &keys {
            tree.insert(k, k).unwrap();
        }
        let collected: Vec<u64> = tree.iter_all().unwrap().map(|(k, _)| k).collect();
        let mut expected: Vec<u64> = (0..800).collect();
        expected.sort();
        assert_eq!(collected, expected);
    }

    #[test]
    fn insert_next_is_monotone() {
        let tree: BTree<u64, u64> = BTree::create(cache(64)).unwrap();
        let mut prev = None;
        for i in 0..300u64 {
            let k = tree.insert_next(i).unwrap();
            if let Some(p) = prev {
                assert!(k > p);
            }
            prev = Some(k);
        }
    }

    #[test]
    fn latch_for_update_mutates_in_place() {
        let tree: BTree<u64, bool> = BTree::create(cache(64)).unwrap();
        tree.insert(5, true).unwrap();
        {
            let mut g = tree.latch_for_update(5).unwrap().unwrap();
            g.set(false);
        }
        assert_eq!(tree.lookup(5).unwrap(), Some(false));
    }

    #[test]
    fn remove_without_merge_still_iterates_remaining_keys() {
        let tree: BTree<u64, u64> = BTree::create(cache(64)).unwrap();
        for k in 0..200u64 {
            tree.insert(k, k).unwrap();
        }
        for k in (0..200u64).step_by(2) {
            tree.remove(k).unwrap();
        }
        let remaining: Vec<u64> = tree.iter_all().unwrap().map(|(k, _)| k).collect();
        let expected: Vec<u64> = (0..200u64).filter(|k| k % 2 == 1).collect();
        assert_eq!(remaining, expected);
        assert_eq!(tree.lookup(0).unwrap(), None);
    }

    #[test]
    fn iter_from_skips_lower_keys() {
        let tree: BTree<u64, u64> = BTree::create(cache(64)).unwrap();
        for k in 0..300u64 {
            tree.insert(k, k).unwrap();
        }
        let collected: Vec<u64> = tree.iter_from(150).unwrap().map(|(k, _)| k).collect();
        let expected: Vec<u64> = (150..300).collect();
        assert_eq!(collected, expected);
    }

    #[test]
    fn composite_key_orders_lexicographically() {
        let a = CompositeKey::new([1, 5]);
        let b = CompositeKey::new([1, 6]);
        let c = CompositeKey::new([2, 0]);
        assert!(a < b);
        assert!(b < c);
    }
}
