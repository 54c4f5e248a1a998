// Free-range index of one arena state. An address-ordered tree (`ad`)
// indexes every free range; a size index sits next to it, split into four
// bucketed trees for the dominant 1..4-page sizes plus one (size, address)
// tree for everything larger. Best fit with low-address tie-break falls
// out of the size tree's secondary key.

use core::cmp::Ordering;
use core::ptr::null_mut;

use crate::options::ReclaimFlags;
use crate::perma::{alloc_description, free_description};
use crate::rb::{RbOrder, RbTree};
use crate::types::{
    byte_advance, byte_back, byte_distance, Description, Page, PAGE_SHIFT, PAGE_SIZE, THP_SIZE,
};

pub(crate) const SMALL_COUNT: usize = 4;
pub(crate) const SMALL_MAX_SIZE: usize = SMALL_COUNT * PAGE_SIZE;

#[inline]
const fn small_size_to_idx(size: usize) -> usize {
    (size >> PAGE_SHIFT) - 1
}

#[inline]
const fn small_idx_to_size(idx: usize) -> usize {
    (idx + 1) << PAGE_SHIFT
}

// Address order through the first link slot: the `ad` tree.
pub(crate) enum AdOrder {}

impl RbOrder for AdOrder {
    const LINK: usize = 0;
    type Key = *mut Page;

    unsafe fn cmp(key: *mut Page, node: *const Description) -> Ordering {
        (key as usize).cmp(&((*node).addr as usize))
    }

    unsafe fn lt(a: *const Description, b: *const Description) -> bool {
        ((*a).addr as usize) < ((*b).addr as usize)
    }
}

// Address order through the second link slot: the small size buckets.
// Every node in one bucket has the same size, so address order is
// (size, address) order.
pub(crate) enum BucketOrder {}

impl RbOrder for BucketOrder {
    const LINK: usize = 1;
    type Key = *mut Page;

    unsafe fn cmp(key: *mut Page, node: *const Description) -> Ordering {
        (key as usize).cmp(&((*node).addr as usize))
    }

    unsafe fn lt(a: *const Description, b: *const Description) -> bool {
        ((*a).addr as usize) < ((*b).addr as usize)
    }
}

// (size, address) order through the second link slot: the large size
// tree. The key comparison never reports equality, so `nsearch(size)`
// lands on the smallest sufficient node with the lowest address.
pub(crate) enum SzAdOrder {}

impl RbOrder for SzAdOrder {
    const LINK: usize = 1;
    type Key = usize;

    unsafe fn cmp(size: usize, node: *const Description) -> Ordering {
        if size <= (*node).size {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    unsafe fn lt(a: *const Description, b: *const Description) -> bool {
        (*a).size < (*b).size || ((*a).size == (*b).size && ((*a).addr as usize) < ((*b).addr as usize))
    }
}

pub(crate) struct PageTreeAllocator {
    ad: RbTree<AdOrder>,
    szad_small: [RbTree<BucketOrder>; SMALL_COUNT],
    szad_large: RbTree<SzAdOrder>,
}

impl PageTreeAllocator {
    pub const fn new() -> Self {
        PageTreeAllocator {
            ad: RbTree::new(),
            szad_small: [
                RbTree::new(),
                RbTree::new(),
                RbTree::new(),
                RbTree::new(),
            ],
            szad_large: RbTree::new(),
        }
    }

    unsafe fn remove_from_szad(&mut self, desc: *mut Description) {
        if (*desc).size <= SMALL_MAX_SIZE {
            self.szad_small[small_size_to_idx((*desc).size)].remove(desc);
        } else {
            self.szad_large.remove(desc);
        }
    }

    unsafe fn insert_to_szad(&mut self, desc: *mut Description) {
        if (*desc).size <= SMALL_MAX_SIZE {
            self.szad_small[small_size_to_idx((*desc).size)].insert(desc);
        } else {
            self.szad_large.insert(desc);
        }
    }

    /// Best-fit removal of exactly `size` bytes, or null. Oversized hits
    /// are carved from the low end so the working set stays dense.
    pub unsafe fn allocate(&mut self, size: usize) -> *mut Page {
        if size <= SMALL_MAX_SIZE {
            let mut k = small_size_to_idx(size);
            let desc = self.szad_small[k].pop_first();
            if !desc.is_null() {
                // Perfect fit.
                self.ad.remove(desc);
                let ret = (*desc).addr;
                free_description(desc);
                return ret;
            }

            k += 1;
            while k < SMALL_COUNT {
                let desc = self.szad_small[k].pop_first();
                if !desc.is_null() {
                    let ret = (*desc).addr;
                    // Raising addr within the old range keeps the node's
                    // position in `ad` valid.
                    (*desc).addr = byte_advance(ret, size);
                    (*desc).size = small_idx_to_size(k) - size;
                    self.szad_small[small_size_to_idx((*desc).size)].insert(desc);
                    return ret;
                }
                k += 1;
            }
        }

        let desc = self.szad_large.nsearch(size);
        if desc.is_null() {
            return null_mut();
        }
        debug_assert!((*desc).size >= size);
        self.szad_large.remove(desc);
        let ret;
        if (*desc).size == size {
            // Perfect size.
            self.ad.remove(desc);
            ret = (*desc).addr;
            free_description(desc);
        } else {
            // We always prefer smaller addresses.
            ret = (*desc).addr;
            (*desc).addr = byte_advance(ret, size);
            (*desc).size -= size;
            self.insert_to_szad(desc);
        }
        ret
    }

    /// Merge a freed range into the trees, coalescing with both
    /// neighbours. Returns false only if a fresh record was needed and
    /// the description pool came up empty; the range is then untracked
    /// and the caller must discard it.
    pub unsafe fn reclaim(&mut self, page: *mut Page, size: usize, flags: ReclaimFlags) -> bool {
        debug_assert!(!page.is_null());
        debug_assert!(size != 0);
        debug_assert!(size % PAGE_SIZE == 0);

        // Can we merge right?
        let succ = if flags.contains(ReclaimFlags::NOMERGE_RIGHT) {
            null_mut()
        } else {
            self.ad.search(byte_advance(page, size))
        };
        if !succ.is_null() {
            self.remove_from_szad(succ);
        }

        // Can we merge left?
        let mut prec = if flags.contains(ReclaimFlags::NOMERGE_LEFT) {
            null_mut()
        } else {
            self.ad.psearch(page)
        };
        if !prec.is_null() && byte_advance((*prec).addr, (*prec).size) != page {
            prec = null_mut();
        }

        let desc;
        if !prec.is_null() {
            // Merge backward.
            self.remove_from_szad(prec);
            let mut grown = size;
            if !succ.is_null() {
                // Both directions.
                grown += (*succ).size;
                self.ad.remove(succ);
                free_description(succ);
                // prec's position in `ad` needs no change.
            }
            (*prec).size += grown;
            desc = prec;
        } else if !succ.is_null() {
            // Forward only; succ's position in `ad` needs no change.
            (*succ).addr = page;
            (*succ).size += size;
            desc = succ;
        } else {
            // Neither.
            let fresh = alloc_description();
            if fresh.is_null() {
                return false;
            }
            (*fresh).addr = page;
            (*fresh).size = size;
            self.ad.insert(fresh);
            desc = fresh;
        }

        self.insert_to_szad(desc);
        true
    }

    /// Insert a fresh range without looking for neighbours. The caller
    /// has already proven none exists.
    pub unsafe fn reclaim_nomerge(&mut self, page: *mut Page, size: usize) -> bool {
        debug_assert!(!page.is_null());
        debug_assert!(size != 0);
        debug_assert!(size % PAGE_SIZE == 0);

        let desc = alloc_description();
        if desc.is_null() {
            return false;
        }
        (*desc).addr = page;
        (*desc).size = size;
        self.ad.insert(desc);
        self.insert_to_szad(desc);
        true
    }

    /// If a free range starts exactly at `ptr + old` and holds at least
    /// `grow` bytes, consume `grow` off its low end and report success.
    pub unsafe fn extend_nomove(&mut self, ptr: *mut Page, old: usize, grow: usize) -> bool {
        debug_assert!(!ptr.is_null());
        debug_assert!(old != 0 && old % PAGE_SIZE == 0);
        debug_assert!(grow != 0 && grow % PAGE_SIZE == 0);
        debug_assert!(ptr as usize % PAGE_SIZE == 0);

        let target = byte_advance(ptr, old);
        let succ = self.ad.search(target);
        if succ.is_null() || (*succ).size < grow {
            return false;
        }
        self.remove_from_szad(succ);
        if (*succ).size == grow {
            // Perfect size.
            self.ad.remove(succ);
            free_description(succ);
        } else {
            // Return the higher portion to the tree.
            (*succ).size -= grow;
            (*succ).addr = byte_advance(target, grow);
            self.insert_to_szad(succ);
        }
        true
    }

    /// Extract every range of at least `threshold` bytes, chained through
    /// the record `next` pointers. With `thp_aware` and a threshold above
    /// twice the THP size, each candidate is pre-trimmed to THP alignment
    /// and the cut-off edges go back into the trees as ordinary ranges.
    pub unsafe fn get_deallocate_candidates(
        &mut self,
        threshold: usize,
        thp_aware: bool,
    ) -> *mut Description {
        let mut list: *mut Description = null_mut();

        let mut p = self.szad_large.last();
        while !p.is_null() && (*p).size >= threshold {
            let q = self.szad_large.prev(p);

            self.szad_large.remove(p);
            self.ad.remove(p);

            if THP_SIZE > 0 && thp_aware && THP_SIZE * 2 < threshold {
                // Split from the right down to the THP boundary.
                let end = byte_advance((*p).addr, (*p).size);
                let offset = end as usize % THP_SIZE;
                if offset != 0 {
                    (*p).size -= offset;
                    let _ = self.reclaim_nomerge(byte_back(end, offset), offset);
                }

                // Split from the left up to the THP boundary.
                let adjust = ((*p).addr as usize).wrapping_neg() % THP_SIZE;
                if adjust != 0 {
                    let addr = (*p).addr;
                    (*p).addr = byte_advance(addr, adjust);
                    (*p).size -= adjust;
                    let _ = self.reclaim_nomerge(addr, adjust);
                }
            }

            (*p).next = list;
            list = p;

            p = q;
        }

        let mut size = SMALL_MAX_SIZE;
        while size > 0 && size >= threshold {
            let idx = small_size_to_idx(size);
            loop {
                let q = self.szad_small[idx].pop_first();
                if q.is_null() {
                    break;
                }
                self.ad.remove(q);
                (*q).next = list;
                list = q;
            }
            size -= PAGE_SIZE;
        }

        list
    }

    /// Remove every byte of `[page, page + size)` from this tree,
    /// splitting boundary nodes where the range cuts through them.
    pub unsafe fn remove_by_range(&mut self, page: *mut Page, size: usize) {
        self.remove_by_range_with(page, size, |_, _| {});
    }

    /// Like `remove_by_range`, invoking `callback` on each removed
    /// sub-range actually found in the tree.
    pub unsafe fn remove_by_range_with<F>(&mut self, page: *mut Page, size: usize, mut callback: F)
    where
        F: FnMut(*mut Page, usize),
    {
        let end = byte_advance(page, size);
        let mut page = page;

        let mut p = self.ad.psearch(page);

        if !p.is_null() {
            // The first node needs separate handling: the range may start
            // inside it.
            if (page as usize) <= (*p).addr as usize {
                // Nothing to do; fall through to the regular logic.
            } else {
                let p_end = byte_advance((*p).addr, (*p).size);
                if (page as usize) < p_end as usize {
                    if (end as usize) < p_end as usize {
                        // The range is in the middle of the node.
                        callback(page, size);
                        self.remove_from_szad(p);
                        (*p).size = byte_distance((*p).addr, page);
                        self.insert_to_szad(p);

                        // There is nothing we can really do if the pool
                        // is out of records, so the tail is dropped.
                        let p_new = alloc_description();
                        if !p_new.is_null() {
                            (*p_new).addr = end;
                            (*p_new).size = byte_distance(end, p_end);
                            self.ad.insert(p_new);
                            self.insert_to_szad(p_new);
                        }
                        return;
                    } else {
                        // The range covers a suffix of the node.
                        callback(page, byte_distance(page, p_end));
                        self.remove_from_szad(p);
                        (*p).size = byte_distance((*p).addr, page);
                        self.insert_to_szad(p);
                        if end == p_end {
                            return;
                        }
                    }
                }
                p = self.ad.next(p);
            }
        } else {
            p = self.ad.first();
        }

        while !p.is_null() {
            // Skip the gap before the node.
            if end as usize <= (*p).addr as usize {
                return;
            }
            page = (*p).addr;

            let p_end = byte_advance((*p).addr, (*p).size);

            if (end as usize) < p_end as usize {
                // The range is a prefix of the node.
                self.remove_from_szad(p);
                (*p).addr = end;
                (*p).size = byte_distance(end, p_end);
                self.insert_to_szad(p);
                callback(page, byte_distance(page, end));
                return;
            } else {
                // The range covers the whole node.
                callback(page, (*p).size);
                let next_p = self.ad.next(p);
                self.ad.remove(p);
                self.remove_from_szad(p);
                free_description(p);
                p = next_p;
            }
        }
    }

    /// Remove every range named by the chain (linked through `next`).
    /// The chain itself is untouched.
    pub unsafe fn remove_by_list(&mut self, list: *const Description) {
        let mut cur = list;
        while !cur.is_null() {
            self.remove_by_range((*cur).addr, (*cur).size);
            cur = (*cur).next;
        }
    }

    #[cfg(test)]
    pub(crate) unsafe fn collect_ranges(&self) -> std::vec::Vec<(usize, usize)> {
        let mut out = std::vec::Vec::new();
        let mut p = self.ad.first();
        while !p.is_null() {
            out.push(((*p).addr as usize, (*p).size));
            p = self.ad.next(p);
        }
        out
    }

    #[cfg(test)]
    pub(crate) unsafe fn total_bytes(&self) -> usize {
        self.collect_ranges().iter().map(|&(_, s)| s).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::disable_brk;
    use std::vec::Vec;

    const NOMERGE: ReclaimFlags = ReclaimFlags::empty();

    fn page(addr: usize) -> *mut Page {
        addr as *mut Page
    }

    #[test]
    fn best_fit_prefers_low_address() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            assert!(tree.reclaim(page(0x10000), 4 * PAGE_SIZE, NOMERGE));
            assert!(tree.reclaim(page(0x20000), 4 * PAGE_SIZE, NOMERGE));

            let got = tree.allocate(2 * PAGE_SIZE);
            assert_eq!(got as usize, 0x10000);

            let mut ranges = tree.collect_ranges();
            ranges.sort_unstable();
            assert_eq!(
                ranges,
                vec![(0x12000, 2 * PAGE_SIZE), (0x20000, 4 * PAGE_SIZE)]
            );
        }
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_size() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            assert!(tree.reclaim(page(0x100000), 64 * PAGE_SIZE, NOMERGE));
            assert!(tree.reclaim(page(0x800000), 8 * PAGE_SIZE, NOMERGE));

            // 6 pages fit both; the 8-page range wins despite the higher
            // address.
            let got = tree.allocate(6 * PAGE_SIZE);
            assert_eq!(got as usize, 0x800000);
        }
    }

    #[test]
    fn neighbours_coalesce() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            let a = 0x40000;
            assert!(tree.reclaim(page(a), PAGE_SIZE, NOMERGE));
            assert!(tree.reclaim(page(a + 2 * PAGE_SIZE), PAGE_SIZE, NOMERGE));
            assert_eq!(tree.collect_ranges().len(), 2);

            // The middle page bridges both neighbours.
            assert!(tree.reclaim(page(a + PAGE_SIZE), PAGE_SIZE, NOMERGE));
            assert_eq!(tree.collect_ranges(), vec![(a, 3 * PAGE_SIZE)]);

            // Reclaiming adjacent on the left extends the same node.
            assert!(tree.reclaim(page(a - PAGE_SIZE), PAGE_SIZE, NOMERGE));
            assert_eq!(tree.collect_ranges(), vec![(a - PAGE_SIZE, 4 * PAGE_SIZE)]);
        }
    }

    #[test]
    fn nomerge_flags_suppress_coalescing() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            assert!(tree.reclaim(page(0x40000), PAGE_SIZE, NOMERGE));
            assert!(tree.reclaim(
                page(0x41000),
                PAGE_SIZE,
                ReclaimFlags::NOMERGE_LEFT | ReclaimFlags::NOMERGE_RIGHT
            ));
            assert_eq!(tree.collect_ranges().len(), 2);
        }
    }

    #[test]
    fn extend_nomove_consumes_successor() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            assert!(tree.reclaim(page(0x50000), 4 * PAGE_SIZE, NOMERGE));

            // No free range at 0x50000 + 1 page.
            assert!(!tree.extend_nomove(page(0x4e000), PAGE_SIZE, PAGE_SIZE));

            // Partial consumption shifts the node up.
            assert!(tree.extend_nomove(page(0x4f000), PAGE_SIZE, PAGE_SIZE));
            assert_eq!(tree.collect_ranges(), vec![(0x51000, 3 * PAGE_SIZE)]);

            // Exact consumption removes it.
            assert!(tree.extend_nomove(page(0x4f000), 2 * PAGE_SIZE, 3 * PAGE_SIZE));
            assert!(tree.collect_ranges().is_empty());
        }
    }

    #[test]
    fn remove_by_range_splits_nodes() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            assert!(tree.reclaim(page(0x100000), 8 * PAGE_SIZE, NOMERGE));

            let mut removed = Vec::new();
            tree.remove_by_range_with(page(0x102000), 2 * PAGE_SIZE, |p, s| {
                removed.push((p as usize, s));
            });
            assert_eq!(removed, vec![(0x102000, 2 * PAGE_SIZE)]);

            let mut ranges = tree.collect_ranges();
            ranges.sort_unstable();
            assert_eq!(
                ranges,
                vec![(0x100000, 2 * PAGE_SIZE), (0x104000, 4 * PAGE_SIZE)]
            );

            // A range spanning a gap and two nodes reports only what the
            // tree actually held.
            let mut removed = Vec::new();
            tree.remove_by_range_with(page(0x101000), 5 * PAGE_SIZE, |p, s| {
                removed.push((p as usize, s));
            });
            assert_eq!(
                removed,
                vec![(0x101000, PAGE_SIZE), (0x104000, 2 * PAGE_SIZE)]
            );
            let mut ranges = tree.collect_ranges();
            ranges.sort_unstable();
            assert_eq!(
                ranges,
                vec![(0x100000, PAGE_SIZE), (0x106000, 2 * PAGE_SIZE)]
            );
        }
    }

    #[test]
    fn deallocate_candidates_respect_threshold() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            assert!(tree.reclaim(page(0x200000), 2 * PAGE_SIZE, NOMERGE));
            assert!(tree.reclaim(page(0x300000), 16 * PAGE_SIZE, NOMERGE));
            assert!(tree.reclaim(page(0x400000), 32 * PAGE_SIZE, NOMERGE));

            let mut list = tree.get_deallocate_candidates(16 * PAGE_SIZE, false);
            let mut extracted = Vec::new();
            while !list.is_null() {
                extracted.push(((*list).addr as usize, (*list).size));
                let next = (*list).next;
                free_description(list);
                list = next;
            }
            extracted.sort_unstable();
            assert_eq!(
                extracted,
                vec![(0x300000, 16 * PAGE_SIZE), (0x400000, 32 * PAGE_SIZE)]
            );
            assert_eq!(tree.collect_ranges(), vec![(0x200000, 2 * PAGE_SIZE)]);
        }
    }

    #[test]
    fn thp_aware_candidates_trim_to_boundary() {
        disable_brk();
        let mut tree = PageTreeAllocator::new();
        unsafe {
            // 10 MiB range straddling THP boundaries on both ends.
            let addr = 0x10003000usize;
            let size = 10 * (1 << 20);
            assert!(tree.reclaim(page(addr), size, NOMERGE));

            let threshold = 5 * (1 << 20);
            let mut list = tree.get_deallocate_candidates(threshold, true);
            let mut extracted = Vec::new();
            while !list.is_null() {
                extracted.push(((*list).addr as usize, (*list).size));
                let next = (*list).next;
                free_description(list);
                list = next;
            }
            assert_eq!(extracted, vec![(0x10200000, 8 * (1 << 20))]);

            // The trimmed-off edges stay in the tree; no byte was lost.
            let mut ranges = tree.collect_ranges();
            ranges.sort_unstable();
            assert_eq!(
                ranges,
                vec![(0x10003000, 0x1fd000), (0x10a00000, 0x3000)]
            );
        }
    }

    #[test]
    fn candidate_list_round_trips_through_remove_by_list() {
        disable_brk();
        let mut all = PageTreeAllocator::new();
        let mut dirty = PageTreeAllocator::new();
        unsafe {
            for &(addr, pages) in &[(0x600000usize, 8usize), (0x700000, 16), (0x800000, 3)] {
                assert!(all.reclaim(page(addr), pages * PAGE_SIZE, NOMERGE));
                assert!(dirty.reclaim(page(addr), pages * PAGE_SIZE, NOMERGE));
            }
            let list = dirty.get_deallocate_candidates(4 * PAGE_SIZE, false);
            all.remove_by_list(list);
            // Only the 3-page range survives in either tree.
            assert_eq!(all.collect_ranges(), vec![(0x800000, 3 * PAGE_SIZE)]);
            assert_eq!(dirty.collect_ranges(), vec![(0x800000, 3 * PAGE_SIZE)]);

            let mut cur = list;
            while !cur.is_null() {
                let next = (*cur).next;
                free_description(cur);
                cur = next;
            }
        }
    }
}
