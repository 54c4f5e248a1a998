// Front end of the page allocator: routes requests through the
// per-thread caches, picks the arena, and maintains the large-block size
// index so that large frees and reallocs work from the pointer alone.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arena::Arena;
use crate::options::{AllocateOptions, ReclaimFlags};
use crate::raw::{RawPageAllocator, RAW_MMAP, RAW_MMAP_NO_THP};
use crate::tc::{
    self, page_category_to_size, size_to_page_category, PageCategoryCache, PAGE_MAX_CATEGORY,
    PAGE_PREFERRED_COUNT,
};
use crate::trie::LARGE_BLOCK_TRIE;
use crate::types::{byte_advance, pagesize_ceil, Page, PAGE_SHIFT, PAGE_SIZE, THP_SIZE};

#[cfg(feature = "brk")]
use crate::raw::RAW_BRK;

#[cfg(feature = "brk")]
pub(crate) static ARENA_BRK: Arena = Arena::new(&RAW_BRK);
pub(crate) static ARENA_MMAP: Arena = Arena::new(&RAW_MMAP);
pub(crate) static ARENA_MMAP_NO_THP: Arena = Arena::new(&RAW_MMAP_NO_THP);

// ------------------------------------------------------
// Large-block size index
// ------------------------------------------------------

#[inline]
fn lookup_large_block(page: *mut Page) -> *const AtomicU32 {
    LARGE_BLOCK_TRIE.lookup(page as usize >> PAGE_SHIFT)
}

unsafe fn set_large_block_size(page: *mut Page, n: usize) -> bool {
    let slot = lookup_large_block(page);
    if slot.is_null() {
        return false;
    }
    (*slot).store((n >> PAGE_SHIFT) as u32, Ordering::Release);
    true
}

unsafe fn lookup_large_block_size_fail_crash(page: *mut Page) -> usize {
    let slot = LARGE_BLOCK_TRIE.lookup_fail_crash(page as usize >> PAGE_SHIFT);
    (slot.load(Ordering::Acquire) as usize) << PAGE_SHIFT
}

// ------------------------------------------------------
// Page allocation front end
// ------------------------------------------------------

fn allocate_page_uncached(size: usize, options: AllocateOptions) -> *mut Page {
    #[cfg(feature = "brk")]
    if !options.force_mmap && crate::options::brk_enabled() {
        let page = ARENA_BRK.allocate(size, options.zero);
        if !page.is_null() {
            return page;
        }
        // The brk arena cannot grow further; retry below from mmap.
    }
    let arena = if THP_SIZE > 0 && options.force_mmap {
        &ARENA_MMAP_NO_THP
    } else {
        &ARENA_MMAP
    };
    arena.allocate(size, options.zero)
}

// Which arena a reclaimed range belongs to: brk memory goes home by
// address; everything else routes by the NO_THP bit.
fn arena_for(from_brk: bool, use_no_thp: bool) -> &'static Arena {
    #[cfg(feature = "brk")]
    if from_brk {
        return &ARENA_BRK;
    }
    let _ = from_brk;
    if use_no_thp {
        &ARENA_MMAP_NO_THP
    } else {
        &ARENA_MMAP
    }
}

unsafe fn select_page_cache(
    tc: *mut tc::ThreadCache,
    from_brk: bool,
    use_no_thp: bool,
) -> *mut PageCategoryCache {
    #[cfg(feature = "brk")]
    if from_brk {
        return &mut (*tc).page_category_cache_brk;
    }
    let _ = from_brk;
    if use_no_thp {
        &mut (*tc).page_category_cache_no_thp
    } else {
        &mut (*tc).page_category_cache
    }
}

unsafe fn try_allocate_from_cache(cache: &mut PageCategoryCache, cat: usize) -> *mut Page {
    let ret = cache.list[cat];
    if !ret.is_null() {
        cache.list[cat] = (*ret).next;
        cache.count[cat] -= 1;
    }
    ret
}

/// Allocate `size` bytes of contiguous whole pages. Like an anonymous
/// mmap: allocations and reclaims need not pair up, a caller may reclaim
/// any whole sub-range of what it was given.
pub fn allocate_page(size: usize, options: AllocateOptions) -> *mut Page {
    debug_assert!(size != 0);
    debug_assert!(size % PAGE_SIZE == 0);

    let tc = tc::get_thread_cache();

    if !tc.is_null() && !options.zero && size <= page_category_to_size(PAGE_MAX_CATEGORY) {
        let cat = size_to_page_category(size);
        unsafe {
            #[cfg(feature = "brk")]
            if !options.force_mmap {
                let ret = try_allocate_from_cache(&mut (*tc).page_category_cache_brk, cat);
                if !ret.is_null() {
                    return ret;
                }
            }

            let cache = if THP_SIZE > 0 && options.force_mmap {
                &mut (*tc).page_category_cache_no_thp
            } else {
                &mut (*tc).page_category_cache
            };
            let ret = try_allocate_from_cache(cache, cat);
            if !ret.is_null() {
                return ret;
            }
        }
    }
    allocate_page_uncached(size, options)
}

/// Return pages obtained from `allocate_page`.
///
/// # Safety
///
/// `page` must denote `size` bytes of whole pages currently owned by the
/// caller and obtained from this allocator; the flags must be truthful.
pub unsafe fn reclaim_page(page: *mut Page, size: usize, flags: ReclaimFlags) {
    debug_assert!(!page.is_null());
    debug_assert!(size != 0);
    debug_assert!(size % PAGE_SIZE == 0);

    let from_brk = RawPageAllocator::is_from_brk(page as *mut u8);
    let use_no_thp = THP_SIZE > 0 && flags.contains(ReclaimFlags::NO_THP);

    let arena = arena_for(from_brk, use_no_thp);

    if size <= page_category_to_size(PAGE_MAX_CATEGORY) {
        let tc = tc::get_or_create_thread_cache();
        if !tc.is_null() {
            let cache = &mut *select_page_cache(tc, from_brk, use_no_thp);

            let cat = size_to_page_category(size);

            let cache_head = cache.list[cat];
            (*page).next = cache_head;

            if (cache.count[cat] as usize) < PAGE_PREFERRED_COUNT * 2 {
                cache.count[cat] += 1;
                cache.list[cat] = page;
            } else {
                // Keep some, free the rest in one batch.
                cache.count[cat] -= PAGE_PREFERRED_COUNT as u8;

                let mut check = cache_head;
                for _ in 1..PAGE_PREFERRED_COUNT {
                    check = (*check).next;
                }
                cache.list[cat] = core::mem::replace(&mut (*check).next, null_mut());

                arena.reclaim_list(page, size);
            }
            return;
        }
    }

    arena.reclaim(page, size, flags);
}

/// `reclaim_page` taking the options the pages were allocated with; only
/// the arena-selecting bit survives the translation.
///
/// # Safety
///
/// As for `reclaim_page`.
pub unsafe fn reclaim_page_opts(page: *mut Page, size: usize, options: AllocateOptions) {
    let flags = if options.force_mmap {
        ReclaimFlags::NO_THP
    } else {
        ReclaimFlags::empty()
    };
    reclaim_page(page, size, flags);
}

// ------------------------------------------------------
// Large allocations
// ------------------------------------------------------

/// Allocate `n` bytes rounded up to whole pages and record the size in
/// the large-block index. Returns null on failure (or aborts, with the
/// abort-on-oom feature).
pub fn alloc_large(n: usize, zero: bool) -> *mut u8 {
    debug_assert!(n != 0);
    let n = pagesize_ceil(n);
    // The index stores a 32-bit page count.
    if (n >> PAGE_SHIFT) > u32::MAX as usize {
        return nomem();
    }
    let page = allocate_page(n, AllocateOptions::new().with_zero(zero));
    if page.is_null() {
        return nomem();
    }
    unsafe {
        if !set_large_block_size(page, n) {
            reclaim_page(page, n, ReclaimFlags::empty());
            return null_mut();
        }
    }
    page as *mut u8
}

/// Free a large block by pointer alone; the size comes from the index.
/// The index entry is left in place: overwriting it on the next
/// allocation at this frame is cheaper than retiring it now.
///
/// # Safety
///
/// `ptr` must be the base of a live large allocation. Anything else
/// crashes the process by design.
pub unsafe fn free_large(ptr: *mut u8) {
    let page = ptr as *mut Page;
    let size = lookup_large_block_size_fail_crash(page);
    reclaim_page(page, size, ReclaimFlags::empty());
}

/// Sized-free variant: trusts the caller and skips the index read.
///
/// # Safety
///
/// `ptr` must be the base of a live large allocation of `n` bytes
/// (before page rounding).
pub unsafe fn free_large_sized(ptr: *mut u8, n: usize) {
    let page = ptr as *mut Page;
    let size = pagesize_ceil(n);
    reclaim_page(page, size, ReclaimFlags::empty());
}

/// Resize a large block. Shrinking reclaims the tail in place; growing
/// first tries to extend in place from the mmap arena, then falls back to
/// allocate-copy-free.
///
/// # Safety
///
/// `ptr` must be the base of a live large allocation and `new_size`
/// non-zero.
pub unsafe fn realloc_large(ptr: *mut u8, new_size: usize) -> *mut u8 {
    let new_size = pagesize_ceil(new_size);
    let page = ptr as *mut Page;
    let slot = LARGE_BLOCK_TRIE.lookup_fail_crash(page as usize >> PAGE_SHIFT);
    let old_size = (slot.load(Ordering::Acquire) as usize) << PAGE_SHIFT;
    if old_size == new_size {
        ptr
    } else if old_size > new_size {
        // Shrink.
        slot.store((new_size >> PAGE_SHIFT) as u32, Ordering::Release);
        reclaim_page(
            byte_advance(page, new_size),
            old_size - new_size,
            ReclaimFlags::NOMERGE_LEFT,
        );
        ptr
    } else {
        // Extend.
        if (new_size >> PAGE_SHIFT) > u32::MAX as usize {
            return nomem();
        }
        if ARENA_MMAP.extend_nomove(page, old_size, new_size - old_size) {
            slot.store((new_size >> PAGE_SHIFT) as u32, Ordering::Release);
            ptr
        } else {
            let nptr = alloc_large(new_size, false);
            if !nptr.is_null() {
                core::ptr::copy_nonoverlapping(ptr as *const u8, nptr, old_size);
                reclaim_page(page, old_size, ReclaimFlags::empty());
            }
            nptr
        }
    }
}

/// Number of bytes backing the large allocation at `ptr`.
///
/// # Safety
///
/// `ptr` must be the base of a live large allocation.
pub unsafe fn large_allocated_size(ptr: *const u8) -> usize {
    lookup_large_block_size_fail_crash(ptr as *mut Page)
}

/// Flush this thread's page caches and release idle dirty ranges of at
/// least `pad` bytes back to the kernel. The kernel calls run after each
/// arena lock is dropped.
pub fn large_trim(pad: usize) {
    let tc = tc::get_thread_cache();

    #[cfg(feature = "brk")]
    {
        if !tc.is_null() {
            unsafe { ARENA_BRK.clear_page_cache(&mut (*tc).page_category_cache_brk) };
        }
        let clean_list = ARENA_BRK.trim_and_extract(Some(pad));
        unsafe { ARENA_BRK.clear_description_list(clean_list) };
    }

    {
        if !tc.is_null() {
            unsafe { ARENA_MMAP.clear_page_cache(&mut (*tc).page_category_cache) };
        }
        let clean_list = ARENA_MMAP.trim_and_extract(Some(pad));
        unsafe { ARENA_MMAP.clear_description_list(clean_list) };
    }

    if THP_SIZE > 0 {
        if !tc.is_null() {
            unsafe { ARENA_MMAP_NO_THP.clear_page_cache(&mut (*tc).page_category_cache_no_thp) };
        }
        let clean_list = ARENA_MMAP_NO_THP.trim_and_extract(Some(pad));
        unsafe { ARENA_MMAP_NO_THP.clear_description_list(clean_list) };
    }

    // The description cache is left alone: records come from a permanent
    // pool and would never reach the kernel anyway.
}

/// Out-of-memory exit point: sets ENOMEM and yields null, or aborts with
/// the abort-on-oom feature.
#[cold]
pub fn nomem() -> *mut u8 {
    #[cfg(feature = "abort-on-oom")]
    {
        unsafe { libc::abort() }
    }
    #[cfg(not(feature = "abort-on-oom"))]
    {
        errno::set_errno(errno::Errno(libc::ENOMEM));
        null_mut()
    }
}
