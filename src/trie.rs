// Process-wide sparse trie mapping the page frame number of a large
// block's base address to its size in pages. Lookup by pointer alone is
// what lets `free_large(p)` work without a size argument or a central
// hash table. Nodes are one cache line; missing interior nodes are
// installed lock-free with a CAS and never removed.

use core::mem;
use core::ptr::{null_mut, write_bytes};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use static_assertions::const_assert_eq;

use crate::perma::PermaPool;
use crate::types::PAGE_SHIFT;

// Valid virtual address width, minus the page bits, is the key width.
#[cfg(target_arch = "x86_64")]
const POINTER_VALID_BITS: usize = 56;
#[cfg(target_arch = "aarch64")]
const POINTER_VALID_BITS: usize = 52;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const POINTER_VALID_BITS: usize = usize::BITS as usize;

const KEY_BITS: usize = POINTER_VALID_BITS - PAGE_SHIFT;

const NODE_SIZE: usize = 64;
const LEVEL_FANOUT: usize = NODE_SIZE / mem::size_of::<*mut TrieNode>();
const LEAF_FANOUT: usize = NODE_SIZE / mem::size_of::<u32>();
const LEVEL_BITS: usize = LEVEL_FANOUT.trailing_zeros() as usize;
const LEAF_BITS: usize = LEAF_FANOUT.trailing_zeros() as usize;
const LEVELS: usize = (KEY_BITS - LEAF_BITS) / LEVEL_BITS;
const TOP_BITS: usize = (KEY_BITS - LEAF_BITS) % LEVEL_BITS;
const TOP_FANOUT: usize = 1 << TOP_BITS;

// A node is either an interior array of child links or a leaf array of
// 32-bit sizes-in-pages; its role is implied by its depth, so the two
// views share the same 64 raw bytes.
#[repr(C, align(64))]
struct TrieNode {
    links: [AtomicPtr<TrieNode>; LEVEL_FANOUT],
}

const_assert_eq!(mem::size_of::<TrieNode>(), NODE_SIZE);

impl TrieNode {
    #[inline]
    unsafe fn value_slot(node: *mut TrieNode, idx: usize) -> *const AtomicU32 {
        debug_assert!(idx < LEAF_FANOUT);
        (node as *const AtomicU32).add(idx)
    }
}

pub(crate) struct PfnTrie {
    nodes: PermaPool<TrieNode>,
    head: [AtomicPtr<TrieNode>; TOP_FANOUT],
}

pub(crate) static LARGE_BLOCK_TRIE: PfnTrie = PfnTrie::new();

impl PfnTrie {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const NULL_LINK: AtomicPtr<TrieNode> = AtomicPtr::new(null_mut());
        PfnTrie {
            nodes: PermaPool::new(),
            head: [NULL_LINK; TOP_FANOUT],
        }
    }

    #[inline]
    fn top_slot(&self, pfn: usize) -> &AtomicPtr<TrieNode> {
        let idx = if TOP_BITS > 0 {
            pfn >> (LEVELS * LEVEL_BITS + LEAF_BITS)
        } else {
            0
        };
        &self.head[idx]
    }

    /// Walk to the leaf slot for `pfn`, installing missing nodes along
    /// the way. Returns null only when the node pool cannot grow. The
    /// returned slot may read zero if no large block is recorded there.
    pub fn lookup(&self, pfn: usize) -> *const AtomicU32 {
        debug_assert!(pfn < (1usize << KEY_BITS));

        let mut slot = self.top_slot(pfn);
        let mut node;
        let mut shift = (LEVELS * LEVEL_BITS) as isize;
        loop {
            node = self.ensure_node(slot);
            if node.is_null() {
                return core::ptr::null();
            }
            shift -= LEVEL_BITS as isize;
            if shift < 0 {
                break;
            }
            let idx = (pfn >> (shift as usize + LEAF_BITS)) & (LEVEL_FANOUT - 1);
            slot = unsafe { &(*node).links[idx] };
        }
        unsafe { TrieNode::value_slot(node, pfn & (LEAF_FANOUT - 1)) }
    }

    /// Walk to the leaf slot for `pfn` without allocating.
    ///
    /// # Safety
    ///
    /// The chain of interior nodes for `pfn` must already exist, i.e. a
    /// successful `lookup` of the same frame must have happened before.
    /// If it does not, this dereferences a null link and takes the
    /// process down; that is the intended failure mode of the hot free
    /// path handed a pointer that was never a large block base.
    pub unsafe fn lookup_fail_crash(&self, pfn: usize) -> &AtomicU32 {
        debug_assert!(pfn < (1usize << KEY_BITS));

        let mut node = self.top_slot(pfn).load(Ordering::Acquire);
        let mut shift = ((LEVELS - 1) * LEVEL_BITS) as isize;
        while shift >= 0 {
            let idx = (pfn >> (shift as usize + LEAF_BITS)) & (LEVEL_FANOUT - 1);
            node = (*node).links[idx].load(Ordering::Acquire);
            shift -= LEVEL_BITS as isize;
        }
        &*TrieNode::value_slot(node, pfn & (LEAF_FANOUT - 1))
    }

    #[inline]
    fn ensure_node(&self, slot: &AtomicPtr<TrieNode>) -> *mut TrieNode {
        let node = slot.load(Ordering::Acquire);
        if !node.is_null() {
            return node;
        }
        self.ensure_node_heavy(slot)
    }

    #[cold]
    fn ensure_node_heavy(&self, slot: &AtomicPtr<TrieNode>) -> *mut TrieNode {
        let next = self.nodes.alloc();
        if next.is_null() {
            return null_mut();
        }
        unsafe {
            write_bytes(next as *mut u8, 0, NODE_SIZE);
        }
        match slot.compare_exchange(null_mut(), next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => next,
            Err(winner) => {
                // Lost the install race; recycle ours and use the winner.
                self.nodes.free(next);
                winner
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::disable_brk;
    use std::sync::Arc;
    use std::vec::Vec;

    #[test]
    fn stored_sizes_read_back() {
        disable_brk();
        let trie = PfnTrie::new();

        let pfns = [0usize, 1, 15, 16, 0x12345, (1 << KEY_BITS) - 2];
        for (i, &pfn) in pfns.iter().enumerate() {
            let slot = trie.lookup(pfn);
            assert!(!slot.is_null());
            unsafe { (*slot).store(i as u32 + 1, Ordering::Release) };
        }
        for (i, &pfn) in pfns.iter().enumerate() {
            let slot = trie.lookup(pfn);
            assert_eq!(
                unsafe { (*slot).load(Ordering::Acquire) },
                i as u32 + 1
            );
        }
        // A frame never written reads zero, even next to written ones.
        let slot = trie.lookup(2);
        assert_eq!(unsafe { (*slot).load(Ordering::Acquire) }, 0);
    }

    #[test]
    fn fail_crash_path_agrees_with_lookup() {
        disable_brk();
        let trie = PfnTrie::new();

        let pfn = 0xdeadb;
        let slot = trie.lookup(pfn);
        unsafe {
            (*slot).store(42, Ordering::Release);
            assert_eq!(trie.lookup_fail_crash(pfn).load(Ordering::Acquire), 42);
        }
    }

    #[test]
    fn concurrent_first_touch_installs_once() {
        disable_brk();
        let trie = Arc::new(PfnTrie::new());

        let mut handles = Vec::new();
        for t in 0..8usize {
            let trie = Arc::clone(&trie);
            handles.push(std::thread::spawn(move || {
                // All threads race on a shared leaf region plus write one
                // private slot each.
                for i in 0..64usize {
                    let slot = trie.lookup(0x40000 + i);
                    assert!(!slot.is_null());
                }
                let own = 0x50000 + t;
                let slot = trie.lookup(own);
                unsafe { (*slot).store(t as u32 + 100, Ordering::Release) };
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8usize {
            let slot = trie.lookup(0x50000 + t);
            assert_eq!(
                unsafe { (*slot).load(Ordering::Acquire) },
                t as u32 + 100
            );
        }
    }
}
