//! The size index: an intrusive AVL multiset of free blocks keyed by their
//! payload size.

use core::ptr;

/// A node of the size index, embedded at the start of a free block's payload.
///
/// The index is:
///  * **intrusive** — node storage is borrowed from the free payload it keys,
///    so indexing a block costs no allocation
///  * **a multiset** — equal keys are permitted; ties descend right
///  * **parent-linked** — removal by node handle needs no search from the root
///  * **height-balanced** — insert, remove, and lookup are all O(log n)
///
/// ### Safety:
/// `AvlNode`s are inherently unsafe due to the referencial dependency between
/// nodes. A node must never move while linked, and a handle passed to
/// [`AvlTree::remove`] must currently be linked into that tree. Exclusive
/// access to the tree must be maintained by its owner; it is not thread-safe.
pub struct AvlNode {
    left: *mut AvlNode,
    right: *mut AvlNode,
    parent: *mut AvlNode,
    key: usize,
    height: usize,
}

impl AvlNode {
    /// The key `node` was inserted under.
    /// ### Safety:
    /// `node` must be initialised and linked.
    #[inline]
    pub unsafe fn key(node: *const AvlNode) -> usize {
        (*node).key
    }
}

/// An ordered multiset of embedded [`AvlNode`]s.
pub struct AvlTree {
    root: *mut AvlNode,
}

impl AvlTree {
    pub const fn new() -> Self {
        Self { root: ptr::null_mut() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    #[inline]
    fn height(node: *mut AvlNode) -> usize {
        if node.is_null() { 0 } else { unsafe { (*node).height } }
    }

    #[inline]
    unsafe fn update(node: *mut AvlNode) {
        let l = Self::height((*node).left);
        let r = Self::height((*node).right);
        (*node).height = 1 + if l > r { l } else { r };
    }

    #[inline]
    unsafe fn balance(node: *mut AvlNode) -> isize {
        Self::height((*node).left) as isize - Self::height((*node).right) as isize
    }

    /// Hang `new` (which may be null) where `old` currently hangs.
    unsafe fn transplant(&mut self, old: *mut AvlNode, new: *mut AvlNode) {
        let parent = (*old).parent;
        if parent.is_null() {
            self.root = new;
        } else if (*parent).left == old {
            (*parent).left = new;
        } else {
            (*parent).right = new;
        }
        if !new.is_null() {
            (*new).parent = parent;
        }
    }

    unsafe fn rotate_left(&mut self, x: *mut AvlNode) {
        let y = (*x).right;
        (*x).right = (*y).left;
        if !(*x).right.is_null() {
            (*(*x).right).parent = x;
        }
        self.transplant(x, y);
        (*y).left = x;
        (*x).parent = y;
        Self::update(x);
        Self::update(y);
    }

    unsafe fn rotate_right(&mut self, x: *mut AvlNode) {
        let y = (*x).left;
        (*x).left = (*y).right;
        if !(*x).left.is_null() {
            (*(*x).left).parent = x;
        }
        self.transplant(x, y);
        (*y).right = x;
        (*x).parent = y;
        Self::update(x);
        Self::update(y);
    }

    /// Re-establish heights and the balance bound from `node` up to the root.
    unsafe fn rebalance(&mut self, mut node: *mut AvlNode) {
        while !node.is_null() {
            Self::update(node);
            let mut top = node;
            let balance = Self::balance(node);
            if balance > 1 {
                if Self::balance((*node).left) < 0 {
                    self.rotate_left((*node).left);
                }
                self.rotate_right(node);
                top = (*node).parent;
            } else if balance < -1 {
                if Self::balance((*node).right) > 0 {
                    self.rotate_right((*node).right);
                }
                self.rotate_left(node);
                top = (*node).parent;
            }
            node = (*top).parent;
        }
    }

    /// Initialise `node` in place and link it into the tree under `key`.
    ///
    /// ### Safety:
    /// `node` must be valid for writes, properly aligned, and must stay put
    /// until removed.
    pub unsafe fn insert(&mut self, node: *mut AvlNode, key: usize) {
        let mut parent = ptr::null_mut();
        let mut link = &mut self.root as *mut *mut AvlNode;
        while !(*link).is_null() {
            parent = *link;
            link = if key < (*parent).key {
                &mut (*parent).left
            } else {
                &mut (*parent).right
            };
        }
        node.write(AvlNode {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent,
            key,
            height: 1,
        });
        *link = node;
        self.rebalance(parent);
    }

    /// Unlink `node`. Its storage is not read or written afterwards, and no
    /// other node moves.
    ///
    /// ### Safety:
    /// `node` must currently be linked into this tree.
    pub unsafe fn remove(&mut self, node: *mut AvlNode) {
        let pivot;
        if (*node).left.is_null() {
            pivot = (*node).parent;
            self.transplant(node, (*node).right);
        } else if (*node).right.is_null() {
            pivot = (*node).parent;
            self.transplant(node, (*node).left);
        } else {
            // two children: splice the in-order successor into node's place
            let mut heir = (*node).right;
            while !(*heir).left.is_null() {
                heir = (*heir).left;
            }
            if (*heir).parent == node {
                pivot = heir;
            } else {
                pivot = (*heir).parent;
                self.transplant(heir, (*heir).right);
                (*heir).right = (*node).right;
                (*(*heir).right).parent = heir;
            }
            self.transplant(node, heir);
            (*heir).left = (*node).left;
            (*(*heir).left).parent = heir;
            (*heir).height = (*node).height;
        }
        if !pivot.is_null() {
            self.rebalance(pivot);
        }
    }

    /// Best-fit lookup: the node with the least key that is at least `key`,
    /// or null when no node qualifies.
    pub fn find_best(&self, key: usize) -> *mut AvlNode {
        let mut node = self.root;
        let mut best = ptr::null_mut();
        while !node.is_null() {
            unsafe {
                if (*node).key >= key {
                    best = node;
                    node = (*node).left;
                } else {
                    node = (*node).right;
                }
            }
        }
        best
    }

    /// Visit every node in key order.
    ///
    /// ### Safety:
    /// The tree must not be mutated during the walk.
    pub unsafe fn walk<F: FnMut(*mut AvlNode)>(&self, visit: &mut F) {
        Self::walk_from(self.root, visit);
    }

    unsafe fn walk_from<F: FnMut(*mut AvlNode)>(node: *mut AvlNode, visit: &mut F) {
        if node.is_null() {
            return;
        }
        Self::walk_from((*node).left, visit);
        visit(node);
        Self::walk_from((*node).right, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backing storage with a stable address for one node.
    fn new_node() -> *mut AvlNode {
        Box::into_raw(Box::new(AvlNode {
            left: ptr::null_mut(),
            right: ptr::null_mut(),
            parent: ptr::null_mut(),
            key: 0,
            height: 0,
        }))
    }

    fn release(nodes: Vec<*mut AvlNode>) {
        for node in nodes {
            drop(unsafe { Box::from_raw(node) });
        }
    }

    fn keys_in_order(tree: &AvlTree) -> Vec<usize> {
        let mut keys = Vec::new();
        let mut visit = |node: *mut AvlNode| keys.push(unsafe { (*node).key });
        unsafe { tree.walk(&mut visit) };
        keys
    }

    /// Checks the search order, parent links, and the height bound of the
    /// whole subtree; returns its height.
    unsafe fn check_subtree(node: *mut AvlNode) -> usize {
        if node.is_null() {
            return 0;
        }
        let left = (*node).left;
        let right = (*node).right;
        if !left.is_null() {
            assert!((*left).key <= (*node).key);
            assert_eq!((*left).parent, node);
        }
        if !right.is_null() {
            assert!((*right).key >= (*node).key);
            assert_eq!((*right).parent, node);
        }
        let lh = check_subtree(left);
        let rh = check_subtree(right);
        assert!((lh as isize - rh as isize).abs() <= 1, "balance bound broken");
        let height = 1 + lh.max(rh);
        assert_eq!((*node).height, height);
        height
    }

    fn check(tree: &AvlTree) {
        if !tree.is_empty() {
            assert!(unsafe { (*tree.root).parent.is_null() });
        }
        unsafe { check_subtree(tree.root) };
    }

    /// Deterministic shuffle; a plain LCG is plenty for layout variety.
    fn permuted(count: usize) -> Vec<usize> {
        let mut keys: Vec<usize> = (0..count).map(|i| i * 16).collect();
        let mut state: u64 = 0x9e37_79b9;
        for i in (1..keys.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            keys.swap(i, (state >> 33) as usize % (i + 1));
        }
        keys
    }

    #[test]
    fn insert_orders_and_balances() {
        let mut tree = AvlTree::new();
        let mut nodes = Vec::new();
        for key in permuted(128) {
            let node = new_node();
            unsafe { tree.insert(node, key) };
            nodes.push(node);
            check(&tree);
        }
        let keys = keys_in_order(&tree);
        let expected: Vec<usize> = (0..128).map(|i| i * 16).collect();
        assert_eq!(keys, expected);
        release(nodes);
    }

    #[test]
    fn duplicate_keys_coexist() {
        let mut tree = AvlTree::new();
        let mut nodes = Vec::new();
        for key in [48, 48, 96, 48, 96, 160] {
            let node = new_node();
            unsafe { tree.insert(node, key) };
            nodes.push(node);
            check(&tree);
        }
        assert_eq!(keys_in_order(&tree), vec![48, 48, 48, 96, 96, 160]);
        release(nodes);
    }

    #[test]
    fn find_best_is_least_upper_fit() {
        let mut tree = AvlTree::new();
        assert!(tree.find_best(1).is_null());

        let mut nodes = Vec::new();
        for key in [64, 256, 1024, 4096] {
            let node = new_node();
            unsafe { tree.insert(node, key) };
            nodes.push(node);
        }

        assert_eq!(unsafe { AvlNode::key(tree.find_best(0)) }, 64);
        assert_eq!(unsafe { AvlNode::key(tree.find_best(64)) }, 64);
        assert_eq!(unsafe { AvlNode::key(tree.find_best(65)) }, 256);
        assert_eq!(unsafe { AvlNode::key(tree.find_best(4096)) }, 4096);
        assert!(tree.find_best(4097).is_null());
        release(nodes);
    }

    #[test]
    fn remove_by_handle() {
        let mut tree = AvlTree::new();
        let mut nodes = Vec::new();
        let count = 64;
        for key in permuted(count) {
            let node = new_node();
            unsafe { tree.insert(node, key) };
            nodes.push(node);
        }

        // removing in handle order exercises leaves, inner nodes, and roots
        let mut remaining: Vec<usize> = nodes.iter().map(|&n| unsafe { (*n).key }).collect();
        for &node in &nodes {
            unsafe { tree.remove(node) };
            let key = unsafe { (*node).key };
            remaining.remove(remaining.iter().position(|&k| k == key).unwrap());
            check(&tree);
            let mut sorted = remaining.clone();
            sorted.sort_unstable();
            assert_eq!(keys_in_order(&tree), sorted);
        }
        assert!(tree.is_empty());
        release(nodes);
    }

    #[test]
    fn remove_the_root_repeatedly() {
        let mut tree = AvlTree::new();
        let mut nodes = Vec::new();
        for key in permuted(32) {
            let node = new_node();
            unsafe { tree.insert(node, key) };
            nodes.push(node);
        }
        while !tree.is_empty() {
            unsafe { tree.remove(tree.root) };
            check(&tree);
        }
        release(nodes);
    }

    #[test]
    fn reinsertion_after_removal() {
        let mut tree = AvlTree::new();
        let a = new_node();
        let b = new_node();
        unsafe {
            tree.insert(a, 480);
            tree.insert(b, 160);
            tree.remove(a);
            tree.insert(a, 320);
        }
        assert_eq!(keys_in_order(&tree), vec![160, 320]);
        check(&tree);
        release(vec![a, b]);
    }
}
