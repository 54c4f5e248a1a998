// An arena owns every page range obtained from one raw page source and
// tracks the free ones in three tree states: `clean` (known zero),
// `dirty` (unspecified contents) and `all` (their union as ranges,
// coalesced independently). One lock per arena guards all of it; the trim
// path extracts its candidates under the lock and releases them to the
// kernel after dropping it.

use core::cmp;
use core::ptr::{null_mut, write_bytes};

use crate::options::ReclaimFlags;
use crate::os;
use crate::perma::free_description;
use crate::raw::RawPageAllocator;
use crate::sync::Mutex;
use crate::tc::{page_category_to_size, PageCategoryCache, PAGE_CATEGORIES};
use crate::tree::PageTreeAllocator;
use crate::types::{byte_advance, pow2_ceil, Description, Page, PAGE_SIZE, THP_SIZE};

const INITIAL_ALLOC_SIZE: usize = if THP_SIZE > 0 { THP_SIZE } else { PAGE_SIZE * 512 };
const MAX_ALLOC_SIZE: usize = 128 * 1024 * 1024;

// Keep the minimum above 2 x THP so trimming always happens on THP
// boundaries.
const MIN_TRIM_THRESHOLD: usize = if THP_SIZE > 0 { 3 * THP_SIZE } else { PAGE_SIZE * 1536 };
const MAX_TRIM_THRESHOLD: usize = 128 * 1024 * 1024;

struct ArenaInner {
    // Counts reclaimed bytes so we can determine when to attempt a trim.
    reclaim_count: usize,
    total_bytes_allocated: usize,

    // tree_clean holds pages that we know read as zero.
    tree_clean: PageTreeAllocator,
    tree_dirty: PageTreeAllocator,
    tree_all: PageTreeAllocator,
}

unsafe impl Send for ArenaInner {}

#[repr(align(64))]
pub(crate) struct Arena {
    raw: &'static RawPageAllocator,
    inner: Mutex<ArenaInner>,
}

impl ArenaInner {
    const fn new() -> Self {
        ArenaInner {
            reclaim_count: 0,
            total_bytes_allocated: 0,
            tree_clean: PageTreeAllocator::new(),
            tree_dirty: PageTreeAllocator::new(),
            tree_all: PageTreeAllocator::new(),
        }
    }

    unsafe fn allocate(&mut self, raw: &RawPageAllocator, size: usize, zero: bool) -> *mut Page {
        // First try the tree matching the request.
        let mut page = if zero {
            self.tree_clean.allocate(size)
        } else {
            self.tree_dirty.allocate(size)
        };

        if !page.is_null() {
            // Remove the pages from tree_all as well.
            self.tree_all.remove_by_range(page, size);
        } else {
            // A perfect-state range was not available; take any range and
            // fix up the state trees underneath it.
            page = self.tree_all.allocate(size);
            if !page.is_null() {
                self.tree_clean.remove_by_range(page, size);
                if zero {
                    self.tree_dirty.remove_by_range_with(page, size, |sub, n| {
                        write_bytes(sub as *mut u8, 0, n);
                    });
                } else {
                    self.tree_dirty.remove_by_range(page, size);
                }
            }
        }

        if page.is_null() {
            // Grow proportionally to the live set, within
            // [INITIAL_ALLOC_SIZE, MAX_ALLOC_SIZE].
            let alloc_size = pow2_ceil(
                cmp::max(cmp::min(self.total_bytes_allocated, MAX_ALLOC_SIZE), size),
                INITIAL_ALLOC_SIZE,
            );
            page = raw.allocate(alloc_size);
            if page.is_null() {
                return null_mut();
            }
            if size < alloc_size {
                // Fresh kernel memory reads as zero.
                self.reclaim_unlocked(
                    raw,
                    byte_advance(page, size),
                    alloc_size - size,
                    ReclaimFlags::NOMERGE_LEFT | ReclaimFlags::CLEAN,
                );
            }
        }
        self.total_bytes_allocated += size;
        page
    }

    // Does not touch total_bytes_allocated: also called from allocate for
    // the growth remainder.
    unsafe fn reclaim_unlocked(
        &mut self,
        raw: &RawPageAllocator,
        page: *mut Page,
        size: usize,
        flags: ReclaimFlags,
    ) {
        if !flags.contains(ReclaimFlags::CLEAN) {
            self.reclaim_count += size;
        }

        if !self.tree_all.reclaim(page, size, flags) {
            discard(raw, page, size);
            return;
        }

        let tree = if flags.contains(ReclaimFlags::CLEAN) {
            &mut self.tree_clean
        } else {
            &mut self.tree_dirty
        };
        if !tree.reclaim(page, size, flags) {
            self.tree_all.remove_by_range(page, size);
            discard(raw, page, size);
        }
    }

    // Returns the candidate list (linked through `next`) to release after
    // the lock is dropped, or null when below the trim watermark.
    unsafe fn trim_and_extract_unlocked(
        &mut self,
        raw: &RawPageAllocator,
        threshold: Option<usize>,
    ) -> *mut Description {
        let threshold = threshold.unwrap_or_else(|| {
            self.total_bytes_allocated
                .clamp(MIN_TRIM_THRESHOLD, MAX_TRIM_THRESHOLD)
        });

        if self.reclaim_count < threshold.saturating_mul(2) {
            return null_mut();
        }
        self.reclaim_count = 0;
        // Only tree_dirty is consulted: pages in tree_clean are most
        // likely not populated by the kernel yet.
        let list = self
            .tree_dirty
            .get_deallocate_candidates(threshold, THP_SIZE > 0 && raw.allow_thp());
        // The candidates leave tree_all even for a brk arena: the
        // madvise runs without the lock, and they come back afterwards.
        self.tree_all.remove_by_list(list);
        list
    }
}

// Give the range back to the kernel while keeping (brk) or dropping
// (mmap) the address space.
unsafe fn discard(raw: &RawPageAllocator, ptr: *mut Page, size: usize) {
    if raw.use_brk() {
        os::madvise_dontneed(ptr as *mut u8, size);
    } else {
        os::unmap(ptr as *mut u8, size);
    }
}

impl Arena {
    pub const fn new(raw: &'static RawPageAllocator) -> Self {
        Arena {
            raw,
            inner: Mutex::new(ArenaInner::new()),
        }
    }

    pub fn allocate(&self, size: usize, zero: bool) -> *mut Page {
        debug_assert!(size != 0);
        debug_assert!(size % PAGE_SIZE == 0);

        let mut inner = self.inner.lock();
        unsafe { inner.allocate(self.raw, size, zero) }
    }

    pub fn reclaim(&self, page: *mut Page, size: usize, flags: ReclaimFlags) {
        let clean;
        {
            let mut inner = self.inner.lock();
            inner.total_bytes_allocated -= size;
            unsafe {
                inner.reclaim_unlocked(self.raw, page, size, flags);
                // Check whether we can do some cleanup work.
                clean = inner.trim_and_extract_unlocked(self.raw, None);
            }
        }
        unsafe { self.clear_description_list(clean) };
    }

    /// Batch path for the per-thread page cache: a list of pages of one
    /// size, linked through the page memory itself. Adjacent entries are
    /// fused before reclaiming; caches fill with spatially clustered
    /// same-size pages often enough for this to pay off.
    pub fn reclaim_list(&self, page: *mut Page, size: usize) {
        let clean;
        {
            let mut inner = self.inner.lock();
            let mut page = page;
            unsafe {
                while !page.is_null() {
                    let mut next = (*page).next;
                    let mut this_size = size;

                    loop {
                        if next.is_null() {
                            break;
                        } else if byte_advance(next, size) == page {
                            page = next;
                        } else if next != byte_advance(page, this_size) {
                            break;
                        }
                        this_size += size;
                        next = (*next).next;
                    }

                    inner.total_bytes_allocated -= this_size;
                    inner.reclaim_unlocked(self.raw, page, this_size, ReclaimFlags::empty());
                    page = next;
                }
                clean = inner.trim_and_extract_unlocked(self.raw, None);
            }
        }
        unsafe { self.clear_description_list(clean) };
    }

    /// Try to grow the allocation at `ptr` in place by consuming free
    /// pages immediately above it.
    pub fn extend_nomove(&self, ptr: *mut Page, old: usize, grow: usize) -> bool {
        let mut inner = self.inner.lock();
        unsafe {
            // tree_clean first; it is more likely to succeed.
            if !inner.tree_clean.extend_nomove(ptr, old, grow)
                && !inner.tree_dirty.extend_nomove(ptr, old, grow)
            {
                return false;
            }
            inner.tree_all.remove_by_range(byte_advance(ptr, old), grow);
            // The grown tail is handed out now and will come back through
            // reclaim together with the rest of the block.
            inner.total_bytes_allocated += grow;
        }
        true
    }

    pub fn trim_and_extract(&self, threshold: Option<usize>) -> *mut Description {
        let mut inner = self.inner.lock();
        unsafe { inner.trim_and_extract_unlocked(self.raw, threshold) }
    }

    /// Release an extracted candidate list to the kernel. For a brk arena
    /// the ranges are merely discarded and return to the trees as clean;
    /// for an mmap arena they are unmapped and their records freed. The
    /// kernel calls run without the arena lock.
    pub unsafe fn clear_description_list(&self, clean: *mut Description) {
        if self.raw.use_brk() {
            let mut cur = clean;
            while !cur.is_null() {
                os::madvise_dontneed((*cur).addr as *mut u8, (*cur).size);
                cur = (*cur).next;
            }
            let mut inner = self.inner.lock();
            let mut clean = clean;
            while !clean.is_null() {
                let cur = clean;
                inner.reclaim_unlocked(self.raw, (*cur).addr, (*cur).size, ReclaimFlags::CLEAN);
                clean = (*cur).next;
                free_description(cur);
            }
        } else {
            let mut clean = clean;
            while !clean.is_null() {
                let cur = clean;
                os::unmap((*cur).addr as *mut u8, (*cur).size);
                clean = (*cur).next;
                free_description(cur);
            }
        }
    }

    /// Drain a per-thread page cache into this arena.
    pub fn clear_page_cache(&self, cache: &mut PageCategoryCache) {
        let mut inner = self.inner.lock();
        for cat in 0..PAGE_CATEGORIES {
            let mut page = core::mem::replace(&mut cache.list[cat], null_mut());
            cache.count[cat] = 0;
            let size = page_category_to_size(cat);
            unsafe {
                while !page.is_null() {
                    let next = (*page).next;
                    inner.total_bytes_allocated -= size;
                    inner.reclaim_unlocked(self.raw, page, size, ReclaimFlags::empty());
                    page = next;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn total_bytes_allocated(&self) -> usize {
        self.inner.lock().total_bytes_allocated
    }

    #[cfg(test)]
    pub(crate) fn dirty_ranges(&self) -> std::vec::Vec<(usize, usize)> {
        unsafe { self.inner.lock().tree_dirty.collect_ranges() }
    }

    #[cfg(test)]
    pub(crate) fn clean_bytes(&self) -> usize {
        unsafe { self.inner.lock().tree_clean.total_bytes() }
    }

    #[cfg(test)]
    pub(crate) fn free_bytes(&self) -> usize {
        unsafe { self.inner.lock().tree_all.total_bytes() }
    }

    #[cfg(test)]
    pub(crate) fn dirty_bytes(&self) -> usize {
        unsafe { self.inner.lock().tree_dirty.total_bytes() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::disable_brk;
    use crate::raw::RAW_MMAP;

    #[test]
    fn split_then_coalesce() {
        disable_brk();
        let arena = Arena::new(&RAW_MMAP);

        let a = arena.allocate(PAGE_SIZE, false);
        let b = arena.allocate(PAGE_SIZE, false);
        let c = arena.allocate(PAGE_SIZE, false);
        assert!(!a.is_null());
        assert_eq!(b as usize, a as usize + PAGE_SIZE);
        assert_eq!(c as usize, a as usize + 2 * PAGE_SIZE);

        arena.reclaim(a, PAGE_SIZE, ReclaimFlags::empty());
        arena.reclaim(c, PAGE_SIZE, ReclaimFlags::empty());
        arena.reclaim(b, PAGE_SIZE, ReclaimFlags::empty());

        // The dirty tree holds exactly one coalesced 3-page range at `a`.
        assert_eq!(arena.dirty_ranges(), vec![(a as usize, 3 * PAGE_SIZE)]);
        assert_eq!(arena.total_bytes_allocated(), 0);
    }

    #[test]
    fn clean_and_dirty_partition_all() {
        disable_brk();
        let arena = Arena::new(&RAW_MMAP);

        let a = arena.allocate(4 * PAGE_SIZE, false);
        arena.reclaim(a, 2 * PAGE_SIZE, ReclaimFlags::empty());
        assert_eq!(
            arena.clean_bytes() + arena.dirty_bytes(),
            arena.free_bytes()
        );
    }

    #[test]
    fn zeroed_allocation_reuses_dirty_memory() {
        disable_brk();
        let arena = Arena::new(&RAW_MMAP);

        // Consume the entire initial growth so no clean memory remains.
        let base = arena.allocate(INITIAL_ALLOC_SIZE, false);
        assert!(!base.is_null());
        assert_eq!(arena.clean_bytes(), 0);

        unsafe {
            write_bytes(base as *mut u8, 0xAB, 2 * PAGE_SIZE);
        }
        arena.reclaim(base, 2 * PAGE_SIZE, ReclaimFlags::empty());
        assert_eq!(arena.dirty_bytes(), 2 * PAGE_SIZE);

        // The zeroed request must reuse the dirty range and scrub it.
        let z = arena.allocate(2 * PAGE_SIZE, true);
        assert_eq!(z, base);
        unsafe {
            let bytes = core::slice::from_raw_parts(z as *const u8, 2 * PAGE_SIZE);
            assert!(bytes.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn round_trip_zeroes_total() {
        disable_brk();
        let arena = Arena::new(&RAW_MMAP);

        let mut held = std::vec::Vec::new();
        for i in 1..=8usize {
            let p = arena.allocate(i * PAGE_SIZE, false);
            assert!(!p.is_null());
            held.push((p, i * PAGE_SIZE));
        }
        for (p, size) in held.into_iter().rev() {
            arena.reclaim(p, size, ReclaimFlags::empty());
        }
        assert_eq!(arena.total_bytes_allocated(), 0);
    }

    #[test]
    fn trim_extracts_once() {
        disable_brk();
        let arena = Arena::new(&RAW_MMAP);

        let p = arena.allocate(INITIAL_ALLOC_SIZE, false);
        assert!(!p.is_null());
        arena.reclaim(p, INITIAL_ALLOC_SIZE, ReclaimFlags::empty());

        // Explicit threshold low enough that the reclaimed bytes clear
        // the watermark.
        let pad = 16 * PAGE_SIZE;
        let list = arena.trim_and_extract(Some(pad));
        assert!(!list.is_null());
        unsafe { arena.clear_description_list(list) };
        assert_eq!(arena.dirty_bytes(), 0);

        // Idempotent: the second attempt finds nothing to release.
        let list = arena.trim_and_extract(Some(pad));
        assert!(list.is_null());
    }

    #[test]
    fn extend_nomove_grows_in_place() {
        disable_brk();
        let arena = Arena::new(&RAW_MMAP);

        let p = arena.allocate(2 * PAGE_SIZE, false);
        assert!(!p.is_null());
        // The growth remainder sits clean right above p.
        assert!(arena.extend_nomove(p, 2 * PAGE_SIZE, 3 * PAGE_SIZE));
        assert_eq!(
            arena.clean_bytes() + arena.dirty_bytes(),
            arena.free_bytes()
        );
        // An unrelated address has no successor range.
        let far = (p as usize + INITIAL_ALLOC_SIZE) as *mut Page;
        assert!(!arena.extend_nomove(far, PAGE_SIZE, PAGE_SIZE));
    }
}
