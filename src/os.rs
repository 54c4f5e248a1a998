use core::ptr::null_mut;

use libc::{
    madvise, mmap, munmap, MADV_DONTNEED, MADV_NOHUGEPAGE, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use log::warn;

use crate::stats::STATS;
use crate::types::PAGE_SIZE;

// The page size is a compile-time constant; make sure the kernel agrees.
// Called once, from the first thread-cache setup.
pub(crate) fn check_page_size() {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 && result as usize != PAGE_SIZE {
        warn!(
            "kernel page size {} does not match configured page size {}",
            result, PAGE_SIZE
        );
    }
}

// Anonymous read-write mapping of `size` bytes, or null on failure.
// MAP_NORESERVE: arenas over-allocate address space aggressively and most
// of it may never be touched.
pub(crate) unsafe fn mmap_anon(size: usize) -> *mut u8 {
    STATS.mmap_calls.increase(1);
    let p = mmap(
        null_mut(),
        size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
        -1,
        0,
    );
    if p == MAP_FAILED {
        null_mut()
    } else {
        STATS.mapped_bytes.increase(size as i64);
        p as *mut u8
    }
}

pub(crate) unsafe fn unmap(addr: *mut u8, size: usize) {
    STATS.munmap_calls.increase(1);
    if munmap(addr as *mut _, size) == -1 {
        warn!(
            "munmap failed: {}, addr {:p}, size {}",
            errno::errno(),
            addr,
            size
        );
    } else {
        STATS.mapped_bytes.decrease(size as i64);
    }
}

// Tell the kernel the contents are discardable; subsequent reads return
// zero. The pages stay mapped.
pub(crate) unsafe fn madvise_dontneed(addr: *mut u8, size: usize) {
    STATS.madvise_calls.increase(1);
    if madvise(addr as *mut _, size, MADV_DONTNEED) != 0 {
        warn!(
            "madvise(DONTNEED) failed: {}, addr {:p}, size {}",
            errno::errno(),
            addr,
            size
        );
    }
}

pub(crate) unsafe fn madvise_nohugepage(addr: *mut u8, size: usize) {
    STATS.madvise_calls.increase(1);
    if madvise(addr as *mut _, size, MADV_NOHUGEPAGE) != 0 {
        warn!(
            "madvise(NOHUGEPAGE) failed: {}, addr {:p}, size {}",
            errno::errno(),
            addr,
            size
        );
    }
}

// Raw brk syscall. The kernel returns the resulting program break: the
// requested value on success, the unchanged break on failure. The libc
// wrapper hides that, so go through syscall(2) directly.
#[cfg(feature = "brk")]
pub(crate) unsafe fn brk(target: *mut u8) -> *mut u8 {
    STATS.brk_calls.increase(1);
    libc::syscall(libc::SYS_brk, target) as usize as *mut u8
}
