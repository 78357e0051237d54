//! # AVL Tree over Caller-Provided Storage
//!
//! An ordered map with a node capacity fixed at construction. Nodes live in a
//! slot arena borrowed from the caller and are linked by index, so the tree
//! works before any heap exists: the kernel hands it slots carved out of
//! direct-mapped frames, tests hand it a `Vec`.
//!
//! The same tree indexes virtual regions (keyed by base address), the dynamic
//! mapper's free ranges (keyed by `(size, base)`) and the heap's blocks.
//!
//! ```rust
//! # use kernel_alloc::avl::{AvlTree, Slot};
//! let mut slots: Vec<Slot<u32, &str>> = (0..4).map(|_| Slot::vacant()).collect();
//! let mut tree = AvlTree::new(&mut slots);
//! tree.insert(20, "b").unwrap();
//! tree.insert(10, "a").unwrap();
//! assert_eq!(tree.floor(&15), Some((10, &"a")));
//! assert_eq!(tree.successor(&10), Some((20, &"b")));
//! ```

use core::cmp::Ordering;
use kernel_status::{KResult, Status};

type NodeId = u32;

/// Link value for "no node".
const NIL: NodeId = NodeId::MAX;

/// One arena slot. Either part of the free list or holding a tree node.
pub struct Slot<K, V>(SlotState<K, V>);

enum SlotState<K, V> {
    Vacant { next: NodeId },
    Occupied(Node<K, V>),
}

struct Node<K, V> {
    key: K,
    value: V,
    left: NodeId,
    right: NodeId,
    height: u8,
}

impl<K, V> Slot<K, V> {
    /// An unused slot; usable in `const`/`static` initializers.
    #[must_use]
    pub const fn vacant() -> Self {
        Self(SlotState::Vacant { next: NIL })
    }

    /// Initialize `len` slots at `ptr` and return them as a slice.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `len` slots, suitably aligned, and
    /// not aliased for `'s`. Previous contents are overwritten without being
    /// dropped.
    #[allow(unsafe_code)]
    pub unsafe fn init_raw<'s>(ptr: *mut Self, len: usize) -> &'s mut [Self] {
        for i in 0..len {
            unsafe { ptr.add(i).write(Self::vacant()) };
        }
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }
}

/// Balanced ordered map with fixed capacity.
pub struct AvlTree<'s, K, V> {
    slots: &'s mut [Slot<K, V>],
    root: NodeId,
    free: NodeId,
    len: usize,
}

impl<'s, K: Ord + Copy, V> AvlTree<'s, K, V> {
    /// Build an empty tree whose capacity is `slots.len()`.
    ///
    /// Any values still held by `slots` are dropped.
    pub fn new(slots: &'s mut [Slot<K, V>]) -> Self {
        // Indices must fit next to the NIL marker.
        assert!(slots.len() < NIL as usize, "avl: too many slots");
        let mut tree = Self {
            slots,
            root: NIL,
            free: NIL,
            len: 0,
        };
        tree.clear();
        tree
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free == NIL
    }

    /// Height of the tree; `0` when empty.
    #[inline]
    #[must_use]
    pub fn height(&self) -> u8 {
        self.h(self.root)
    }

    /// Remove every entry.
    #[allow(clippy::cast_possible_truncation)]
    pub fn clear(&mut self) {
        let n = self.slots.len();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let next = if i + 1 < n { (i + 1) as NodeId } else { NIL };
            *slot = Slot(SlotState::Vacant { next });
        }
        self.free = if n == 0 { NIL } else { 0 };
        self.root = NIL;
        self.len = 0;
    }

    /// Insert `value` under `key`.
    ///
    /// Returns the previous value if `key` was present (the value is
    /// replaced, no node is consumed).
    ///
    /// # Errors
    /// [`Status::MmTooManyEntries`] if `key` is new and every slot is in use.
    pub fn insert(&mut self, key: K, value: V) -> KResult<Option<V>> {
        if let Some(id) = self.find(&key) {
            let old = core::mem::replace(&mut self.node_mut(id).value, value);
            return Ok(Some(old));
        }
        let id = self.free;
        if id == NIL {
            return Err(Status::MmTooManyEntries);
        }
        let SlotState::Vacant { next } = self.slots[id as usize].0 else {
            panic!("avl: free list links occupied slot {id}");
        };
        self.free = next;
        self.slots[id as usize] = Slot(SlotState::Occupied(Node {
            key,
            value,
            left: NIL,
            right: NIL,
            height: 1,
        }));
        self.root = self.insert_rec(self.root, id);
        self.len += 1;
        Ok(None)
    }

    /// Remove `key` and return its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (root, removed) = self.remove_rec(self.root, key);
        self.root = root;
        let id = removed?;
        let slot = core::mem::replace(
            &mut self.slots[id as usize],
            Slot(SlotState::Vacant { next: self.free }),
        );
        self.free = id;
        self.len -= 1;
        match slot.0 {
            SlotState::Occupied(node) => Some(node.value),
            SlotState::Vacant { .. } => panic!("avl: removed vacant slot {id}"),
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find(key).map(|id| &self.node(id).value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let id = self.find(key)?;
        Some(&mut self.node_mut(id).value)
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Greatest entry with a key `<= key`.
    #[must_use]
    pub fn floor(&self, key: &K) -> Option<(K, &V)> {
        self.bound(key, true, true)
    }

    /// Greatest entry with a key `< key`.
    #[must_use]
    pub fn predecessor(&self, key: &K) -> Option<(K, &V)> {
        self.bound(key, true, false)
    }

    /// Least entry with a key `>= key`.
    #[must_use]
    pub fn ceiling(&self, key: &K) -> Option<(K, &V)> {
        self.bound(key, false, true)
    }

    /// Least entry with a key `> key`.
    #[must_use]
    pub fn successor(&self, key: &K) -> Option<(K, &V)> {
        self.bound(key, false, false)
    }

    #[must_use]
    pub fn first(&self) -> Option<(K, &V)> {
        let mut n = self.root;
        if n == NIL {
            return None;
        }
        while self.node(n).left != NIL {
            n = self.node(n).left;
        }
        Some(self.entry(n))
    }

    #[must_use]
    pub fn last(&self) -> Option<(K, &V)> {
        let mut n = self.root;
        if n == NIL {
            return None;
        }
        while self.node(n).right != NIL {
            n = self.node(n).right;
        }
        Some(self.entry(n))
    }

    /// In-order iterator over all entries.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, 's, K, V> {
        Iter {
            tree: self,
            next: self.first().map(|(k, _)| k),
        }
    }

    fn find(&self, key: &K) -> Option<NodeId> {
        let mut n = self.root;
        while n != NIL {
            let node = self.node(n);
            match key.cmp(&node.key) {
                Ordering::Equal => return Some(n),
                Ordering::Less => n = node.left,
                Ordering::Greater => n = node.right,
            }
        }
        None
    }

    /// Shared walk for `floor`/`predecessor` (`below`) and
    /// `ceiling`/`successor`; `inclusive` admits an exact match.
    fn bound(&self, key: &K, below: bool, inclusive: bool) -> Option<(K, &V)> {
        let mut n = self.root;
        let mut best = NIL;
        while n != NIL {
            let node = self.node(n);
            match key.cmp(&node.key) {
                Ordering::Equal if inclusive => return Some(self.entry(n)),
                Ordering::Equal => n = if below { node.left } else { node.right },
                Ordering::Greater if below => {
                    best = n;
                    n = node.right;
                }
                Ordering::Greater => n = node.right,
                Ordering::Less if below => n = node.left,
                Ordering::Less => {
                    best = n;
                    n = node.left;
                }
            }
        }
        (best != NIL).then(|| self.entry(best))
    }

    fn entry(&self, id: NodeId) -> (K, &V) {
        let node = self.node(id);
        (node.key, &node.value)
    }

    fn node(&self, id: NodeId) -> &Node<K, V> {
        match &self.slots[id as usize].0 {
            SlotState::Occupied(node) => node,
            SlotState::Vacant { .. } => panic!("avl: vacant slot {id} linked into the tree"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node<K, V> {
        match &mut self.slots[id as usize].0 {
            SlotState::Occupied(node) => node,
            SlotState::Vacant { .. } => panic!("avl: vacant slot {id} linked into the tree"),
        }
    }

    fn h(&self, id: NodeId) -> u8 {
        if id == NIL { 0 } else { self.node(id).height }
    }

    fn update_height(&mut self, id: NodeId) {
        let node = self.node(id);
        let h = 1 + self.h(node.left).max(self.h(node.right));
        self.node_mut(id).height = h;
    }

    fn balance_factor(&self, id: NodeId) -> i16 {
        let node = self.node(id);
        i16::from(self.h(node.left)) - i16::from(self.h(node.right))
    }

    fn rotate_right(&mut self, y: NodeId) -> NodeId {
        let x = self.node(y).left;
        let t2 = self.node(x).right;
        self.node_mut(x).right = y;
        self.node_mut(y).left = t2;
        self.update_height(y);
        self.update_height(x);
        x
    }

    fn rotate_left(&mut self, x: NodeId) -> NodeId {
        let y = self.node(x).right;
        let t2 = self.node(y).left;
        self.node_mut(y).left = x;
        self.node_mut(x).right = t2;
        self.update_height(x);
        self.update_height(y);
        y
    }

    /// Restore the AVL property at `n` and return the subtree root.
    fn rebalance(&mut self, n: NodeId) -> NodeId {
        self.update_height(n);
        let bf = self.balance_factor(n);
        if bf > 1 {
            let l = self.node(n).left;
            if self.balance_factor(l) < 0 {
                let nl = self.rotate_left(l);
                self.node_mut(n).left = nl;
            }
            return self.rotate_right(n);
        }
        if bf < -1 {
            let r = self.node(n).right;
            if self.balance_factor(r) > 0 {
                let nr = self.rotate_right(r);
                self.node_mut(n).right = nr;
            }
            return self.rotate_left(n);
        }
        n
    }

    fn insert_rec(&mut self, n: NodeId, id: NodeId) -> NodeId {
        if n == NIL {
            return id;
        }
        if self.node(id).key < self.node(n).key {
            let l = self.insert_rec(self.node(n).left, id);
            self.node_mut(n).left = l;
        } else {
            let r = self.insert_rec(self.node(n).right, id);
            self.node_mut(n).right = r;
        }
        self.rebalance(n)
    }

    /// Returns the new subtree root and the unlinked node, if found.
    fn remove_rec(&mut self, n: NodeId, key: &K) -> (NodeId, Option<NodeId>) {
        if n == NIL {
            return (NIL, None);
        }
        match key.cmp(&self.node(n).key) {
            Ordering::Less => {
                let (l, removed) = self.remove_rec(self.node(n).left, key);
                self.node_mut(n).left = l;
                (self.rebalance(n), removed)
            }
            Ordering::Greater => {
                let (r, removed) = self.remove_rec(self.node(n).right, key);
                self.node_mut(n).right = r;
                (self.rebalance(n), removed)
            }
            Ordering::Equal => {
                let (l, r) = (self.node(n).left, self.node(n).right);
                if l == NIL {
                    return (r, Some(n));
                }
                if r == NIL {
                    return (l, Some(n));
                }
                let (rest, min) = self.detach_min(r);
                let m = self.node_mut(min);
                m.left = l;
                m.right = rest;
                (self.rebalance(min), Some(n))
            }
        }
    }

    /// Unlink the smallest node of the subtree at `n`.
    fn detach_min(&mut self, n: NodeId) -> (NodeId, NodeId) {
        let l = self.node(n).left;
        if l == NIL {
            return (self.node(n).right, n);
        }
        let (rest, min) = self.detach_min(l);
        self.node_mut(n).left = rest;
        (self.rebalance(n), min)
    }

    /// Verify ordering, balance and cached heights; returns the height.
    #[cfg(test)]
    pub(crate) fn check(&self) -> u8 {
        fn walk<K: Ord + Copy, V>(
            t: &AvlTree<'_, K, V>,
            n: NodeId,
            lo: Option<K>,
            hi: Option<K>,
        ) -> u8 {
            if n == NIL {
                return 0;
            }
            let node = t.node(n);
            assert!(lo.is_none_or(|lo| node.key > lo), "order violated");
            assert!(hi.is_none_or(|hi| node.key < hi), "order violated");
            let hl = walk(t, node.left, lo, Some(node.key));
            let hr = walk(t, node.right, Some(node.key), hi);
            assert!(hl.abs_diff(hr) <= 1, "balance violated");
            assert_eq!(node.height, 1 + hl.max(hr), "stale height");
            node.height
        }
        walk(self, self.root, None, None)
    }
}

/// In-order iterator of an [`AvlTree`].
pub struct Iter<'t, 's, K, V> {
    tree: &'t AvlTree<'s, K, V>,
    next: Option<K>,
}

impl<'t, K: Ord + Copy, V> Iterator for Iter<'t, '_, K, V> {
    type Item = (K, &'t V);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.next?;
        let id = self.tree.find(&key)?;
        let (k, v) = self.tree.entry(id);
        self.next = self.tree.successor(&k).map(|(k, _)| k);
        Some((k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots<K, V>(n: usize) -> Vec<Slot<K, V>> {
        (0..n).map(|_| Slot::vacant()).collect()
    }

    /// Small deterministic xorshift generator.
    struct XorShift(u32);

    impl XorShift {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut s = slots(2);
        let mut t = AvlTree::new(&mut s);
        assert_eq!(t.insert(1u32, 'a'), Ok(None));
        assert_eq!(t.insert(1, 'b'), Ok(Some('a')));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&1), Some(&'b'));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut s = slots(3);
        let mut t = AvlTree::new(&mut s);
        for k in 0..3u32 {
            t.insert(k, ()).unwrap();
        }
        assert!(t.is_full());
        assert_eq!(t.insert(9, ()), Err(Status::MmTooManyEntries));
        // Replacing an existing key still works when full.
        assert_eq!(t.insert(2, ()), Ok(Some(())));
        assert_eq!(t.remove(&0), Some(()));
        assert_eq!(t.insert(9, ()), Ok(None));
    }

    #[test]
    fn neighbour_queries() {
        let mut s = slots(8);
        let mut t = AvlTree::new(&mut s);
        for k in [10u32, 20, 30, 40] {
            t.insert(k, k * 2).unwrap();
        }
        assert_eq!(t.floor(&25), Some((20, &40)));
        assert_eq!(t.floor(&20), Some((20, &40)));
        assert_eq!(t.floor(&5), None);
        assert_eq!(t.predecessor(&20), Some((10, &20)));
        assert_eq!(t.ceiling(&25), Some((30, &60)));
        assert_eq!(t.ceiling(&30), Some((30, &60)));
        assert_eq!(t.successor(&30), Some((40, &80)));
        assert_eq!(t.successor(&40), None);
        assert_eq!(t.first(), Some((10, &20)));
        assert_eq!(t.last(), Some((40, &80)));
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let n = 1000usize;
        let mut s = slots(n);
        let mut t = AvlTree::new(&mut s);
        for k in 0..n as u32 {
            t.insert(k, ()).unwrap();
        }
        let h = f64::from(t.check());
        #[allow(clippy::cast_precision_loss)]
        let bound = 1.44 * ((n + 2) as f64).log2();
        assert!(h <= bound, "height {h} exceeds {bound}");
    }

    #[test]
    fn random_sequences_keep_order_and_balance() {
        let mut rng = XorShift(0x2545_F491);
        let mut s = slots(256);
        let mut t = AvlTree::new(&mut s);
        let mut model = std::collections::BTreeMap::new();

        for _ in 0..5000 {
            let key = rng.next() % 512;
            if rng.next() % 3 == 0 {
                assert_eq!(t.remove(&key), model.remove(&key));
            } else if !t.is_full() || model.contains_key(&key) {
                assert_eq!(t.insert(key, key).unwrap(), model.insert(key, key));
            }
            let h = f64::from(t.check());
            #[allow(clippy::cast_precision_loss)]
            let bound = 1.44 * ((t.len() + 2) as f64).log2() + 1.0;
            assert!(h <= bound);
        }

        let keys: Vec<u32> = t.iter().map(|(k, _)| k).collect();
        let expected: Vec<u32> = model.keys().copied().collect();
        assert_eq!(keys, expected);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn clear_recycles_all_slots() {
        let mut s = slots(4);
        let mut t = AvlTree::new(&mut s);
        for k in 0..4u32 {
            t.insert(k, ()).unwrap();
        }
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.height(), 0);
        for k in 10..14u32 {
            t.insert(k, ()).unwrap();
        }
        assert_eq!(t.len(), 4);
    }
}
