// Intrusive left-leaning red-black tree over `Description` records,
// following jemalloc's parent-pointer-free formulation. A record carries
// two link slots so it can sit in an address-ordered tree and a
// size-ordered tree at the same time; which slot a tree uses, and how it
// compares nodes, is the `RbOrder` parameter.
//
// All elements must be unique under the order; that is the caller's
// responsibility. The tree never owns memory and never allocates.
// It is not thread-safe; the owning arena's lock is the sole barrier.

use core::cmp::Ordering;
use core::marker::PhantomData;
use core::ptr::null_mut;

use crate::types::Description;

pub(crate) const RED: usize = 1;
pub(crate) const BLACK: usize = 0;

// One tree link. The color lives in the least significant bit of the
// right pointer; `Description` is comfortably more than 2-aligned.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RbLink {
    left: *mut Description,
    right_color: usize,
}

impl RbLink {
    pub(crate) const fn zeroed() -> Self {
        RbLink {
            left: null_mut(),
            right_color: 0,
        }
    }

    #[inline]
    fn left(&self) -> *mut Description {
        self.left
    }

    #[inline]
    fn set_left(&mut self, v: *mut Description) {
        self.left = v;
    }

    #[inline]
    fn right(&self) -> *mut Description {
        (self.right_color & !1) as *mut Description
    }

    #[inline]
    fn set_right(&mut self, v: *mut Description) {
        self.right_color = (self.right_color & 1) | v as usize;
    }

    #[inline]
    fn color(&self) -> usize {
        self.right_color & 1
    }

    #[inline]
    fn set_color(&mut self, color: usize) {
        self.right_color = (self.right_color & !1) | color;
    }

    #[inline]
    fn set_right_color(&mut self, v: *mut Description, color: usize) {
        self.right_color = v as usize | color;
    }

    #[inline]
    fn child(&self, lft: bool) -> *mut Description {
        if lft {
            self.left()
        } else {
            self.right()
        }
    }
}

pub(crate) trait RbOrder {
    /// Which of the two link slots this order uses.
    const LINK: usize;
    type Key: Copy;

    /// Position of `key` relative to `node` under this order.
    unsafe fn cmp(key: Self::Key, node: *const Description) -> Ordering;
    /// Strict order between two nodes.
    unsafe fn lt(a: *const Description, b: *const Description) -> bool;
}

pub(crate) struct RbTree<O: RbOrder> {
    root: *mut Description,
    _order: PhantomData<O>,
}

unsafe impl<O: RbOrder> Send for RbTree<O> {}

impl<O: RbOrder> RbTree<O> {
    pub const fn new() -> Self {
        RbTree {
            root: null_mut(),
            _order: PhantomData,
        }
    }

    #[inline]
    unsafe fn link<'a>(p: *mut Description) -> &'a mut RbLink {
        &mut (*p).links[O::LINK]
    }

    #[inline]
    unsafe fn left(p: *mut Description) -> *mut Description {
        Self::link(p).left()
    }

    #[inline]
    unsafe fn set_left(p: *mut Description, v: *mut Description) {
        Self::link(p).set_left(v);
    }

    #[inline]
    unsafe fn right(p: *mut Description) -> *mut Description {
        Self::link(p).right()
    }

    #[inline]
    unsafe fn set_right(p: *mut Description, v: *mut Description) {
        Self::link(p).set_right(v);
    }

    #[inline]
    unsafe fn left_exchange(p: *mut Description, child: *mut Description) -> *mut Description {
        let ret = Self::left(p);
        Self::set_left(p, child);
        ret
    }

    #[inline]
    unsafe fn right_exchange(p: *mut Description, child: *mut Description) -> *mut Description {
        let ret = Self::right(p);
        Self::set_right(p, child);
        ret
    }

    #[inline]
    unsafe fn color(p: *mut Description) -> usize {
        Self::link(p).color()
    }

    #[inline]
    unsafe fn set_color(p: *mut Description, color: usize) {
        Self::link(p).set_color(color);
    }

    #[inline]
    unsafe fn set_red(p: *mut Description) {
        Self::set_color(p, RED);
    }

    #[inline]
    unsafe fn set_black(p: *mut Description) {
        Self::set_color(p, BLACK);
    }

    #[inline]
    unsafe fn set_right_color(p: *mut Description, right: *mut Description, color: usize) {
        Self::link(p).set_right_color(right, color);
    }

    #[inline]
    unsafe fn is_red(p: *mut Description) -> bool {
        Self::color(p) == RED
    }

    #[inline]
    unsafe fn is_black(p: *mut Description) -> bool {
        Self::color(p) == BLACK
    }

    #[inline]
    unsafe fn color_exchange(p: *mut Description, color: usize) -> usize {
        let ret = Self::color(p);
        Self::set_color(p, color);
        ret
    }

    unsafe fn rotate_left(node: *mut Description) -> *mut Description {
        let r = Self::right(node);
        Self::set_right(node, Self::left_exchange(r, node));
        r
    }

    unsafe fn rotate_right(node: *mut Description) -> *mut Description {
        let r = Self::left(node);
        Self::set_left(node, Self::right_exchange(r, node));
        r
    }

    unsafe fn lean_left(node: *mut Description) -> *mut Description {
        let r = Self::rotate_left(node);
        Self::set_color(r, Self::color_exchange(node, RED));
        r
    }

    unsafe fn lean_right(node: *mut Description) -> *mut Description {
        let r = Self::rotate_right(node);
        Self::set_color(r, Self::color_exchange(node, RED));
        r
    }

    // Replace `oldval` with `newval` among node's children, if present.
    unsafe fn cmpxchg_child(
        node: *mut Description,
        oldval: *mut Description,
        newval: *mut Description,
    ) {
        if Self::left(node) == oldval {
            Self::set_left(node, newval);
        } else if Self::right(node) == oldval {
            Self::set_right(node, newval);
        }
    }

    // Like `cmpxchg_child`, but `oldval` must be one of the children.
    unsafe fn ucmpxchg_child(
        node: *mut Description,
        oldval: *mut Description,
        newval: *mut Description,
    ) {
        debug_assert!(Self::left(node) == oldval || Self::right(node) == oldval);
        if Self::left(node) == oldval {
            Self::set_left(node, newval);
        } else {
            Self::set_right(node, newval);
        }
    }

    unsafe fn move_red_left(node: *mut Description) -> *mut Description {
        Self::set_red(Self::left(node));
        let t = Self::right(node);
        if !t.is_null() && {
            let tl = Self::left(t);
            !tl.is_null() && Self::is_red(tl)
        } {
            Self::set_right(node, Self::rotate_right(t));
            let r = Self::rotate_left(node);
            let rt = Self::right(node);
            if !rt.is_null() && Self::is_red(rt) {
                Self::set_black(rt);
                Self::set_red(node);
                Self::set_left(r, Self::rotate_left(node));
            } else {
                Self::set_black(node);
            }
            r
        } else {
            Self::set_red(node);
            Self::rotate_left(node)
        }
    }

    unsafe fn move_red_right(node: *mut Description) -> *mut Description {
        let t = Self::left(node);
        if Self::is_red(t) {
            let u = Self::right(t);
            let v = Self::left(u);
            if !v.is_null() && Self::is_red(v) {
                Self::set_color(u, Self::color(node));
                Self::set_black(v);
                Self::set_left(node, Self::rotate_left(t));
            } else {
                Self::set_color(t, Self::color(node));
                Self::set_red(u);
            }
            Self::set_red(node);
        } else {
            Self::set_red(t);
            let s = Self::left(t);
            if !s.is_null() && Self::is_red(s) {
                Self::set_black(s);
            } else {
                return Self::rotate_left(node);
            }
        }

        let r = Self::rotate_right(node);
        Self::set_right(r, Self::rotate_left(node));
        r
    }

    unsafe fn subtree_first(root: *mut Description) -> *mut Description {
        let mut r = null_mut();
        let mut p = root;
        while !p.is_null() {
            r = p;
            p = Self::left(p);
        }
        r
    }

    unsafe fn subtree_last(root: *mut Description) -> *mut Description {
        let mut r = null_mut();
        let mut p = root;
        while !p.is_null() {
            r = p;
            p = Self::right(p);
        }
        r
    }

    pub unsafe fn first(&self) -> *mut Description {
        Self::subtree_first(self.root)
    }

    pub unsafe fn last(&self) -> *mut Description {
        Self::subtree_last(self.root)
    }

    pub unsafe fn next(&self, p: *mut Description) -> *mut Description {
        let r = Self::right(p);
        if !r.is_null() {
            return Self::subtree_first(r);
        }
        let mut ret = null_mut();
        let mut node = self.root;
        while node != p {
            debug_assert!(!node.is_null());
            if O::lt(p, node) {
                ret = node;
                node = Self::left(node);
            } else {
                node = Self::right(node);
            }
        }
        ret
    }

    pub unsafe fn prev(&self, p: *mut Description) -> *mut Description {
        let l = Self::left(p);
        if !l.is_null() {
            return Self::subtree_last(l);
        }
        let mut ret = null_mut();
        let mut node = self.root;
        while node != p {
            debug_assert!(!node.is_null());
            if O::lt(p, node) {
                node = Self::left(node);
            } else {
                ret = node;
                node = Self::right(node);
            }
        }
        ret
    }

    /// Exact match for `key`, or null.
    pub unsafe fn search(&self, key: O::Key) -> *mut Description {
        let mut node = self.root;
        while !node.is_null() {
            match O::cmp(key, node) {
                Ordering::Equal => break,
                Ordering::Less => node = Self::left(node),
                Ordering::Greater => node = Self::right(node),
            }
        }
        node
    }

    /// Smallest node not less than `key`, or null.
    pub unsafe fn nsearch(&self, key: O::Key) -> *mut Description {
        let mut node = self.root;
        let mut r = null_mut();
        while !node.is_null() {
            match O::cmp(key, node) {
                Ordering::Less => {
                    r = node;
                    node = Self::left(node);
                }
                Ordering::Greater => node = Self::right(node),
                Ordering::Equal => {
                    r = node;
                    break;
                }
            }
        }
        r
    }

    /// Largest node not greater than `key`, or null.
    pub unsafe fn psearch(&self, key: O::Key) -> *mut Description {
        let mut node = self.root;
        let mut r = null_mut();
        while !node.is_null() {
            match O::cmp(key, node) {
                Ordering::Less => node = Self::left(node),
                Ordering::Greater => {
                    r = node;
                    node = Self::right(node);
                }
                Ordering::Equal => {
                    r = node;
                    break;
                }
            }
        }
        r
    }

    pub unsafe fn insert(&mut self, node: *mut Description) -> *mut Description {
        Self::set_left(node, null_mut());
        Self::set_right_color(node, null_mut(), RED);
        if self.root.is_null() {
            Self::set_right_color(node, null_mut(), BLACK);
            self.root = node;
            return node;
        }

        // Stack sentinel standing in for the root's parent.
        let mut sentinel = Description::zeroed();
        let s: *mut Description = &mut sentinel;
        Self::set_left(s, self.root);
        Self::set_right_color(s, null_mut(), BLACK);

        // Iteratively search down the tree for the insertion point,
        // splitting 4-nodes as they are encountered. At the end of each
        // iteration g -> p -> c is a 3-level path down the tree.
        let mut g: *mut Description = null_mut();
        let mut p = s;
        let mut c = self.root;
        let mut lt = true;
        loop {
            let t = Self::left(c);
            if !t.is_null() && Self::is_red(t) && {
                let tl = Self::left(t);
                !tl.is_null() && Self::is_red(tl)
            } {
                // c is the top of a logical 4-node: split it, passing the
                // red link up one level. This iteration does not move
                // down the tree.
                let top = Self::rotate_right(c);
                Self::set_black(Self::left(top));
                if Self::left(p) == c {
                    Self::set_left(p, top);
                    c = top;
                } else {
                    // c was p's right child: lean left to restore the
                    // left-leaning invariant.
                    debug_assert!(Self::right(p) == c);
                    Self::set_right(p, top);
                    let uu = Self::lean_left(p);
                    Self::ucmpxchg_child(g, p, uu);
                    p = uu;
                    lt = O::lt(node, p);
                    c = Self::link(p).child(lt);
                    if c.is_null() {
                        break;
                    }
                    continue;
                }
            }
            g = p;
            p = c;
            lt = O::lt(node, c);
            c = Self::link(c).child(lt);
            if c.is_null() {
                break;
            }
        }
        // p is the node under which to insert.
        if lt {
            Self::set_left(p, node);
        } else {
            Self::set_right(p, node);
            Self::cmpxchg_child(g, p, Self::lean_left(p));
        }
        self.root = Self::left(s);
        Self::set_black(self.root);

        node
    }

    pub unsafe fn remove(&mut self, node: *mut Description) -> *mut Description {
        let mut sentinel = Description::zeroed();
        let s: *mut Description = &mut sentinel;
        Self::set_left(s, self.root);
        Self::set_right_color(s, null_mut(), BLACK);
        let mut p = s;
        let mut c = self.root;
        let mut xp: *mut Description = null_mut();

        // Iterate down the tree, transforming 2-nodes to 3- or 4-nodes so
        // the current node is never a 2-node; that allows simple deletion
        // once a leaf is reached. The root needs special handling since
        // there may be no way to convert it from a 2-node.
        let mut cmp: i32 = if node == c {
            0
        } else if O::lt(node, c) {
            -1
        } else {
            1
        };
        if cmp < 0 {
            let t = Self::left(c);
            if Self::is_red(t) || {
                let tl = Self::left(t);
                !tl.is_null() && Self::is_red(tl)
            } {
                p = c;
                c = Self::left(c);
            } else {
                c = Self::move_red_left(c);
                Self::set_black(c);
                Self::set_left(p, c);
            }
        } else {
            if node == c {
                if !Self::right(c).is_null() {
                    // This is the node to delete, but it will instead be
                    // swapped with its successor; remember its parent so
                    // the swap can be completed later.
                    xp = p;
                    cmp = 1; // deletion is incomplete
                } else {
                    // Delete the root, which is also a leaf.
                    let mut t = null_mut();
                    if !Self::left(c).is_null() {
                        t = Self::lean_right(c);
                        Self::set_right(t, null_mut());
                    }
                    Self::set_left(p, t);
                }
            }
            if cmp > 0 {
                let cr = Self::right(c);
                if !cr.is_null() && {
                    let crl = Self::left(cr);
                    !crl.is_null() && Self::is_red(crl)
                } {
                    p = c;
                    c = cr;
                } else {
                    let mut t = Self::left(c);
                    if Self::is_red(t) {
                        t = Self::move_red_right(c);
                    } else {
                        // Root-specific transform.
                        Self::set_red(c);
                        let u = Self::left(t);
                        if !u.is_null() && Self::is_red(u) {
                            Self::set_black(u);
                            t = Self::rotate_right(c);
                            Self::set_right(t, Self::rotate_left(c));
                        } else {
                            Self::set_red(t);
                            t = Self::rotate_left(c);
                        }
                    }
                    Self::set_left(p, t);
                    c = t;
                }
            }
        }
        if cmp != 0 {
            loop {
                debug_assert!(!p.is_null());
                if node != c && O::lt(node, c) {
                    let t = Self::left(c);
                    if t.is_null() {
                        // c is the successor to relocate; xp/node hold the
                        // relocation context.
                        *Self::link(c) = *Self::link(node);
                        Self::ucmpxchg_child(xp, node, c);
                        Self::ucmpxchg_child(p, c, null_mut());
                        break;
                    }
                    if Self::is_black(t) && {
                        let tl = Self::left(t);
                        tl.is_null() || Self::is_black(tl)
                    } {
                        let rt = Self::move_red_left(c);
                        Self::ucmpxchg_child(p, c, rt);
                        c = rt;
                    } else {
                        p = c;
                        c = Self::left(c);
                    }
                } else {
                    if node == c {
                        if !Self::right(c).is_null() {
                            // Swap with the successor later; xp is node's
                            // parent at this point.
                            xp = p;
                        } else {
                            // Delete leaf node.
                            let mut t = null_mut();
                            if !Self::left(c).is_null() {
                                t = Self::lean_right(c);
                                Self::set_right(t, null_mut());
                            }
                            Self::ucmpxchg_child(p, c, t);
                            break;
                        }
                    }
                    let t = Self::right(c);
                    if !t.is_null() && {
                        let tl = Self::left(t);
                        !tl.is_null() && Self::is_red(tl)
                    } {
                        p = c;
                        c = Self::right(c);
                    } else {
                        let rt = Self::move_red_right(c);
                        Self::ucmpxchg_child(p, c, rt);
                        c = rt;
                    }
                }
            }
        }
        self.root = Self::left(s);

        node
    }

    /// Remove and return the minimum node, or null on an empty tree.
    pub unsafe fn pop_first(&mut self) -> *mut Description {
        let f = self.first();
        if !f.is_null() {
            self.remove(f);
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Page, PAGE_SIZE};
    use std::boxed::Box;
    use std::vec::Vec;

    enum TestOrder {}

    impl RbOrder for TestOrder {
        const LINK: usize = 0;
        type Key = usize;

        unsafe fn cmp(key: usize, node: *const Description) -> Ordering {
            key.cmp(&((*node).addr as usize))
        }

        unsafe fn lt(a: *const Description, b: *const Description) -> bool {
            ((*a).addr as usize) < ((*b).addr as usize)
        }
    }

    fn make_node(addr: usize) -> *mut Description {
        let mut d = Description::zeroed();
        d.addr = addr as *mut Page;
        d.size = PAGE_SIZE;
        Box::into_raw(Box::new(d))
    }

    unsafe fn in_order(tree: &RbTree<TestOrder>) -> Vec<usize> {
        let mut out = Vec::new();
        let mut p = tree.first();
        while !p.is_null() {
            out.push((*p).addr as usize);
            p = tree.next(p);
        }
        out
    }

    #[test]
    fn insert_orders_nodes() {
        let mut tree = RbTree::<TestOrder>::new();
        let addrs: Vec<usize> = (1..=64usize).map(|i| (i * 31 % 67) * PAGE_SIZE).collect();
        let nodes: Vec<_> = addrs.iter().map(|&a| make_node(a)).collect();
        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            let mut sorted = addrs.clone();
            sorted.sort_unstable();
            assert_eq!(in_order(&tree), sorted);

            // Reverse iteration agrees.
            let mut back = Vec::new();
            let mut p = tree.last();
            while !p.is_null() {
                back.push((*p).addr as usize);
                p = tree.prev(p);
            }
            back.reverse();
            assert_eq!(back, sorted);

            for n in nodes {
                drop(Box::from_raw(n));
            }
        }
    }

    #[test]
    fn search_variants() {
        let mut tree = RbTree::<TestOrder>::new();
        let nodes: Vec<_> = (0..32usize).map(|i| make_node((2 * i + 1) * PAGE_SIZE)).collect();
        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            let hit = tree.search(5 * PAGE_SIZE);
            assert!(!hit.is_null());
            assert_eq!((*hit).addr as usize, 5 * PAGE_SIZE);
            assert!(tree.search(6 * PAGE_SIZE).is_null());

            // nsearch: smallest >= key; psearch: largest <= key.
            let n = tree.nsearch(6 * PAGE_SIZE);
            assert_eq!((*n).addr as usize, 7 * PAGE_SIZE);
            let p = tree.psearch(6 * PAGE_SIZE);
            assert_eq!((*p).addr as usize, 5 * PAGE_SIZE);

            assert!(tree.nsearch(64 * PAGE_SIZE).is_null());
            assert!(tree.psearch(0).is_null());

            for n in nodes {
                drop(Box::from_raw(n));
            }
        }
    }

    #[test]
    fn remove_keeps_order() {
        let mut tree = RbTree::<TestOrder>::new();
        let count = 101usize;
        let addrs: Vec<usize> = (0..count).map(|i| (i * 53 % count + 1) * PAGE_SIZE).collect();
        let nodes: Vec<_> = addrs.iter().map(|&a| make_node(a)).collect();
        unsafe {
            for &n in &nodes {
                tree.insert(n);
            }
            // Remove every third node, in insertion order.
            let mut remaining: Vec<usize> = Vec::new();
            for (i, &n) in nodes.iter().enumerate() {
                if i % 3 == 0 {
                    tree.remove(n);
                } else {
                    remaining.push((*n).addr as usize);
                }
            }
            remaining.sort_unstable();
            assert_eq!(in_order(&tree), remaining);

            // Drain the rest through pop_first.
            let mut popped = Vec::new();
            loop {
                let f = tree.pop_first();
                if f.is_null() {
                    break;
                }
                popped.push((*f).addr as usize);
            }
            assert_eq!(popped, remaining);
            assert!(tree.first().is_null());

            for n in nodes {
                drop(Box::from_raw(n));
            }
        }
    }
}
