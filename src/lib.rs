//! Page-granular memory allocator core for Linux.
//!
//! The crate obtains large contiguous regions from the kernel (program
//! break or anonymous mappings), subdivides them into page-aligned runs,
//! serves and reclaims ranges of whole pages, coalesces neighbours, and
//! returns idle memory to the kernel. Large user allocations are served
//! directly from this layer; their sizes live in a process-wide lock-free
//! trie so `free_large` needs only the pointer.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

mod arena;
mod options;
mod os;
mod page;
mod perma;
mod raw;
mod rb;
mod stats;
mod sync;
mod tc;
mod tree;
mod trie;
mod types;

pub use options::{disable_brk, AllocateOptions, ReclaimFlags};
pub use page::{
    alloc_large, allocate_page, free_large, free_large_sized, large_allocated_size, large_trim,
    nomem, realloc_large, reclaim_page, reclaim_page_opts,
};
pub use stats::{stats, StatCount, Stats};
pub use types::{Page, PAGE_SHIFT, PAGE_SIZE, THP_SIZE};

use core::alloc::{GlobalAlloc, Layout};

/// Byte allocator over the page layer: every request is rounded up to
/// whole pages. Wasteful for small objects (a small-object cache layer
/// belongs on top), exact for anything page-sized and up.
pub struct PageAlloc;

unsafe impl GlobalAlloc for PageAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        alloc_large(layout.size().max(1), false)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        alloc_large(layout.size().max(1), true)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        free_large_sized(ptr, layout.size().max(1));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return core::ptr::null_mut();
        }
        realloc_large(ptr, new_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_alloc_front_round_trips() {
        disable_brk();
        unsafe {
            let layout = Layout::from_size_align(100, 16).unwrap();
            let p = PageAlloc.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % PAGE_SIZE, 0);
            assert_eq!(large_allocated_size(p), PAGE_SIZE);

            core::ptr::write_bytes(p, 0x77, 100);
            let q = PageAlloc.realloc(p, layout, 3 * PAGE_SIZE);
            assert!(!q.is_null());
            assert_eq!(*q.add(99), 0x77);
            PageAlloc.dealloc(q, Layout::from_size_align(3 * PAGE_SIZE, 16).unwrap());

            let z = PageAlloc.alloc_zeroed(layout);
            assert!(!z.is_null());
            assert!((0..100).all(|i| *z.add(i) == 0));
            PageAlloc.dealloc(z, layout);

            // Alignment beyond a page is not this layer's job.
            let over = Layout::from_size_align(PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
            assert!(PageAlloc.alloc(over).is_null());
        }
    }
}
