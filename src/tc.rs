// Per-thread caches: a free list of description records plus one small
// free-page cache per arena. They keep the arena locks out of the hot
// path entirely; only cache overflow and thread exit go back under a
// lock. The cache is set up lazily on first use and drained by a
// pthread-key destructor when its thread exits.

use core::ptr::null_mut;

use crate::perma::DESCRIPTION_POOL;
use crate::types::{Description, Page, PAGE_SIZE};

pub(crate) struct DescriptionCache {
    pub(crate) list: *mut Description,
    pub(crate) count: u32,
}

impl DescriptionCache {
    pub(crate) const PREFERRED_COUNT: u32 = 16;

    const fn new() -> Self {
        DescriptionCache {
            list: null_mut(),
            count: 0,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.count = 0;
        let list = core::mem::replace(&mut self.list, null_mut());
        DESCRIPTION_POOL.free_list(list);
    }
}

pub(crate) const PAGE_MAX_CATEGORY: usize = 7;
pub(crate) const PAGE_CATEGORIES: usize = PAGE_MAX_CATEGORY + 1;
pub(crate) const PAGE_PREFERRED_COUNT: usize = 4;

#[inline]
pub(crate) const fn size_to_page_category(size: usize) -> usize {
    (size - PAGE_SIZE) / PAGE_SIZE
}

#[inline]
pub(crate) const fn page_category_to_size(cat: usize) -> usize {
    PAGE_SIZE * (cat + 1)
}

// Free pages of exact sizes 1..=PAGE_CATEGORIES pages, one singly linked
// list per size, threaded through the page memory itself.
pub(crate) struct PageCategoryCache {
    pub(crate) list: [*mut Page; PAGE_CATEGORIES],
    pub(crate) count: [u8; PAGE_CATEGORIES],
}

impl PageCategoryCache {
    const fn new() -> Self {
        PageCategoryCache {
            list: [null_mut(); PAGE_CATEGORIES],
            count: [0; PAGE_CATEGORIES],
        }
    }
}

pub(crate) struct ThreadCache {
    pub(crate) description_cache: DescriptionCache,
    #[cfg(feature = "brk")]
    pub(crate) page_category_cache_brk: PageCategoryCache,
    pub(crate) page_category_cache: PageCategoryCache,
    pub(crate) page_category_cache_no_thp: PageCategoryCache,
}

impl ThreadCache {
    const fn new() -> Self {
        ThreadCache {
            description_cache: DescriptionCache::new(),
            #[cfg(feature = "brk")]
            page_category_cache_brk: PageCategoryCache::new(),
            page_category_cache: PageCategoryCache::new(),
            page_category_cache_no_thp: PageCategoryCache::new(),
        }
    }

    // Runs with this thread's cache already unreachable: every reclaim
    // below takes the uncached arena paths.
    unsafe fn drain(&mut self) {
        #[cfg(feature = "brk")]
        crate::page::ARENA_BRK.clear_page_cache(&mut self.page_category_cache_brk);
        crate::page::ARENA_MMAP.clear_page_cache(&mut self.page_category_cache);
        crate::page::ARENA_MMAP_NO_THP.clear_page_cache(&mut self.page_category_cache_no_thp);
        self.description_cache.clear();
    }
}

#[cfg(not(feature = "single-threaded"))]
pub(crate) use imp::{get_or_create_thread_cache, get_thread_cache};

#[cfg(feature = "single-threaded")]
pub(crate) use single::{get_or_create_thread_cache, get_thread_cache};

#[cfg(not(feature = "single-threaded"))]
mod imp {
    use core::ptr::{null_mut, write};

    use crate::os;
    use crate::perma::PermaPool;
    use crate::sync::Once;

    use super::ThreadCache;

    // Thread caches are recycled through a permanent pool; creating one
    // therefore only ever takes the pool and raw-source locks, never an
    // arena lock, so a cache can be built from inside arena code.
    static TC_POOL: PermaPool<ThreadCache> = PermaPool::new();

    static TC_KEY: Once<libc::pthread_key_t> = Once::new();

    // The slot value doubles as the lifecycle state: null means the cache
    // was never set up, the sentinel means setup or teardown is running
    // on this thread (callers fall back to the uncached paths), anything
    // else is a ready cache.
    const TC_BUSY: *mut ThreadCache = 1 as *mut ThreadCache;

    fn key() -> libc::pthread_key_t {
        *TC_KEY.call_once(|| {
            os::check_page_size();
            let mut k: libc::pthread_key_t = 0;
            let rc = unsafe { libc::pthread_key_create(&mut k, Some(destroy_thread_cache)) };
            debug_assert_eq!(rc, 0);
            k
        })
    }

    pub(crate) fn get_thread_cache() -> *mut ThreadCache {
        let v = unsafe { libc::pthread_getspecific(key()) } as *mut ThreadCache;
        if v as usize <= TC_BUSY as usize {
            null_mut()
        } else {
            v
        }
    }

    pub(crate) fn get_or_create_thread_cache() -> *mut ThreadCache {
        let k = key();
        let v = unsafe { libc::pthread_getspecific(k) } as *mut ThreadCache;
        if v as usize > TC_BUSY as usize {
            return v;
        }
        if v == TC_BUSY {
            return null_mut();
        }
        create_thread_cache(k)
    }

    #[cold]
    fn create_thread_cache(k: libc::pthread_key_t) -> *mut ThreadCache {
        unsafe {
            libc::pthread_setspecific(k, TC_BUSY as *mut libc::c_void);
            let tc = TC_POOL.alloc();
            if tc.is_null() {
                // Leave the slot at null so a later call may retry.
                libc::pthread_setspecific(k, null_mut());
                return null_mut();
            }
            write(tc, ThreadCache::new());
            libc::pthread_setspecific(k, tc as *mut libc::c_void);
            tc
        }
    }

    unsafe extern "C" fn destroy_thread_cache(ptr: *mut libc::c_void) {
        let tc = ptr as *mut ThreadCache;
        if tc as usize <= TC_BUSY as usize {
            return;
        }
        let k = key();
        // Park the slot on the sentinel so the draining below, and any
        // allocator use later in thread teardown, stays uncached instead
        // of resurrecting a cache.
        libc::pthread_setspecific(k, TC_BUSY as *mut libc::c_void);
        (*tc).drain();
        TC_POOL.free(tc);
        libc::pthread_setspecific(k, null_mut());
    }
}

#[cfg(feature = "single-threaded")]
mod single {
    use core::ptr::addr_of_mut;

    use super::ThreadCache;

    // The one and only cache; the single-threaded feature promises no
    // second thread exists to contend for it.
    static mut THE_CACHE: ThreadCache = ThreadCache::new();

    pub(crate) fn get_thread_cache() -> *mut ThreadCache {
        unsafe { addr_of_mut!(THE_CACHE) }
    }

    pub(crate) fn get_or_create_thread_cache() -> *mut ThreadCache {
        unsafe { addr_of_mut!(THE_CACHE) }
    }
}

#[cfg(all(test, not(feature = "single-threaded")))]
mod tests {
    use super::*;
    use crate::options::disable_brk;

    #[test]
    fn cache_appears_on_demand_and_sticks() {
        disable_brk();
        let first = get_thread_cache();
        let created = get_or_create_thread_cache();
        assert!(!created.is_null());
        let again = get_or_create_thread_cache();
        assert_eq!(created, again);
        // Once created it is visible to the non-creating getter too.
        assert_eq!(get_thread_cache(), created);
        // Whether `first` was null depends on what this test thread ran
        // before; it can only ever be null or the same cache.
        assert!(first.is_null() || first == created);
    }

    #[test]
    fn description_cache_round_trip() {
        disable_brk();
        unsafe {
            let a = crate::perma::alloc_description();
            assert!(!a.is_null());
            crate::perma::free_description(a);
            let tc = get_thread_cache();
            assert!(!tc.is_null());
            assert!((*tc).description_cache.count >= 1);
        }
    }

    #[test]
    fn exiting_thread_drains_its_cache() {
        disable_brk();
        let handle = std::thread::spawn(|| unsafe {
            // Populate the description cache and the page cache.
            let d = crate::perma::alloc_description();
            crate::perma::free_description(d);
            let p = crate::page::allocate_page(PAGE_SIZE, crate::options::AllocateOptions::new());
            assert!(!p.is_null());
            crate::page::reclaim_page(p, PAGE_SIZE, crate::options::ReclaimFlags::empty());
            assert!(!get_thread_cache().is_null());
        });
        handle.join().unwrap();
        // The destructor ran on the exiting thread; nothing to observe
        // here beyond not crashing and this thread's cache being its own.
        let _ = get_or_create_thread_cache();
    }
}
