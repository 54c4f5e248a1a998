// Raw page sources: one per arena family. A source knows how to grow the
// address space in large aligned chunks (program break or anonymous
// mappings) and caches the unused tail of each oversized request for the
// next caller.

use core::mem;
use core::ptr::{null_mut, write_bytes};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::options::brk_enabled;
use crate::os;
use crate::sync::Mutex;
use crate::types::{byte_advance, pow2_ceil, Page, PAGE_SIZE, THP_SIZE};

// Leftover fragment of an oversized growth request, linked through the
// fragment's own leading bytes.
#[repr(C)]
struct CachedPage {
    next: *mut CachedPage,
    size: u32,
}

struct CachedList(*mut CachedPage);

unsafe impl Send for CachedList {}

pub(crate) struct RawPageAllocator {
    use_brk: bool,
    allow_thp: bool,
    cached: Mutex<CachedList>,
}

#[cfg(feature = "brk")]
pub(crate) static RAW_BRK: RawPageAllocator = RawPageAllocator::new(true, true);
pub(crate) static RAW_MMAP: RawPageAllocator = RawPageAllocator::new(false, true);
pub(crate) static RAW_MMAP_NO_THP: RawPageAllocator = RawPageAllocator::new(false, false);

// The raw source backing the permanent record pools.
pub(crate) fn preferred_raw_source() -> &'static RawPageAllocator {
    #[cfg(feature = "brk")]
    if brk_enabled() {
        return &RAW_BRK;
    }
    &RAW_MMAP
}

// The program break is inherently process-global, so its bookkeeping
// lives outside the per-source state.
#[cfg(feature = "brk")]
static BRK_MUTEX: Mutex<()> = Mutex::new(());
static BRK_INITIAL: AtomicUsize = AtomicUsize::new(0);
static BRK_CUR: AtomicUsize = AtomicUsize::new(0);

// Grow the program break by at least `size` bytes, rounding the target up
// to a THP boundary. Returns the acquired base and the actual growth, or
// null if the kernel refused the exact target.
#[cfg(feature = "brk")]
unsafe fn raw_brk_pages(size: usize) -> (*mut u8, usize) {
    let _guard = BRK_MUTEX.lock();
    let mut cur = BRK_CUR.load(Ordering::Relaxed);
    if cur == 0 {
        cur = pow2_ceil(os::brk(null_mut()) as usize, PAGE_SIZE);
        BRK_INITIAL.store(cur, Ordering::Relaxed);
    }
    let preferred = size.max(if THP_SIZE > 0 { THP_SIZE } else { 32 * PAGE_SIZE });
    let mut target = cur + preferred;
    if THP_SIZE > 0 {
        target = pow2_ceil(target, THP_SIZE);
    }
    let alloc_size = target - cur;
    let got = os::brk(target as *mut u8);
    if got as usize != target {
        return (null_mut(), 0);
    }
    BRK_CUR.store(target, Ordering::Relaxed);
    (cur as *mut u8, alloc_size)
}

impl RawPageAllocator {
    pub const fn new(use_brk: bool, allow_thp: bool) -> Self {
        RawPageAllocator {
            use_brk,
            allow_thp,
            cached: Mutex::new(CachedList(null_mut())),
        }
    }

    #[inline]
    pub fn use_brk(&self) -> bool {
        self.use_brk
    }

    #[inline]
    pub fn allow_thp(&self) -> bool {
        self.allow_thp
    }

    /// True iff `ptr` lies in the address range the brk source has
    /// claimed from the kernel.
    pub fn is_from_brk(ptr: *mut u8) -> bool {
        brk_enabled() && {
            let a = ptr as usize;
            a >= BRK_INITIAL.load(Ordering::Relaxed) && a < BRK_CUR.load(Ordering::Relaxed)
        }
    }

    /// Acquire `size` bytes of page-aligned address space, or null. The
    /// request may be over-served by the kernel; the surplus is kept on
    /// the fragment list for the next call.
    pub fn allocate(&self, size: usize) -> *mut Page {
        debug_assert!(size != 0 && size % PAGE_SIZE == 0);

        // Run the whole function, kernel calls included, under the
        // source lock. Growing the address space does not parallelize
        // inside the kernel anyway, and it keeps the brk handling simple.
        let mut cached = self.cached.lock();

        unsafe {
            // First fit from the fragment list, carving from the low end.
            let mut prev: *mut *mut CachedPage = &mut cached.0;
            let mut cur = *prev;
            while !cur.is_null() {
                let cur_size = (*cur).size as usize;
                let cur_next = (*cur).next;
                if cur_size > size {
                    let rest = byte_advance(cur, size);
                    (*rest).next = cur_next;
                    (*rest).size = (cur_size - size) as u32;
                    *prev = rest;
                    write_bytes(cur as *mut u8, 0, mem::size_of::<CachedPage>());
                    return cur as *mut Page;
                } else if cur_size == size {
                    *prev = cur_next;
                    write_bytes(cur as *mut u8, 0, mem::size_of::<CachedPage>());
                    return cur as *mut Page;
                } else {
                    prev = &mut (*cur).next;
                    cur = cur_next;
                }
            }

            let np;
            let alloc_size;
            if self.use_brk {
                #[cfg(feature = "brk")]
                {
                    let (p, n) = raw_brk_pages(size);
                    if p.is_null() {
                        return null_mut();
                    }
                    np = p;
                    alloc_size = n;
                }
                #[cfg(not(feature = "brk"))]
                {
                    return null_mut();
                }
            } else {
                alloc_size = pow2_ceil(
                    size,
                    if THP_SIZE > 0 { THP_SIZE } else { 32 * PAGE_SIZE },
                );
                np = os::mmap_anon(alloc_size);
                if np.is_null() {
                    return null_mut();
                }
                if THP_SIZE > 0 && !self.allow_thp {
                    os::madvise_nohugepage(np, alloc_size);
                }
            }

            if alloc_size > size {
                let rest = byte_advance(np, size) as *mut CachedPage;
                (*rest).next = cached.0;
                (*rest).size = (alloc_size - size) as u32;
                cached.0 = rest;
            }

            np as *mut Page
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::disable_brk;

    #[test]
    fn second_request_comes_from_cached_fragment() {
        disable_brk();
        let raw = RawPageAllocator::new(false, true);
        let a = raw.allocate(PAGE_SIZE);
        assert!(!a.is_null());
        // The first request over-allocated to a THP multiple; the next
        // page must be carved out of the cached tail, adjacent to `a`.
        let b = raw.allocate(PAGE_SIZE);
        assert_eq!(b as usize, a as usize + PAGE_SIZE);
        // An exact-size hit consumes a whole fragment.
        let c = raw.allocate(THP_SIZE - 2 * PAGE_SIZE);
        assert_eq!(c as usize, b as usize + PAGE_SIZE);
        unsafe {
            os::unmap(a as *mut u8, THP_SIZE);
        }
    }

    #[test]
    fn fragments_are_zeroed_on_handout() {
        disable_brk();
        let raw = RawPageAllocator::new(false, true);
        let a = raw.allocate(2 * PAGE_SIZE);
        assert!(!a.is_null());
        let b = raw.allocate(PAGE_SIZE);
        unsafe {
            // The fragment header written at `b` must not leak through.
            let words =
                core::slice::from_raw_parts(b as *const usize, PAGE_SIZE / mem::size_of::<usize>());
            assert!(words.iter().all(|&w| w == 0));
            os::unmap(a as *mut u8, THP_SIZE);
        }
    }
}
