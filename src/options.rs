use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Hints passed along with a page reclaim.
    pub struct ReclaimFlags: u32 {
        /// The caller guarantees no free neighbour exists to the left.
        const NOMERGE_LEFT = 0b0001;
        /// The caller guarantees no free neighbour exists to the right.
        const NOMERGE_RIGHT = 0b0010;
        /// The caller guarantees the pages read as zero.
        const CLEAN = 0b0100;
        /// Return the pages to the THP-forbidden mmap arena.
        const NO_THP = 0b1000;
    }
}

/// Options for `allocate_page` and the large-block front end.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocateOptions {
    /// Maximum supported alignment is the page size, which page
    /// allocations satisfy by construction; the field exists for the
    /// higher-level byte allocator built on top of this crate.
    pub align: u16,
    /// Return zeroed memory.
    pub zero: bool,
    /// Never serve the request from the brk arena. Allocations made with
    /// this flag always come from the THP-forbidden mmap arena and may be
    /// munmap'd directly by the caller.
    pub force_mmap: bool,
}

impl AllocateOptions {
    pub const fn new() -> Self {
        AllocateOptions {
            align: 0,
            zero: false,
            force_mmap: false,
        }
    }

    pub const fn with_align(self, align: u16) -> Self {
        AllocateOptions {
            align,
            zero: self.zero,
            force_mmap: self.force_mmap,
        }
    }

    pub const fn with_zero(self, zero: bool) -> Self {
        AllocateOptions {
            align: self.align,
            zero,
            force_mmap: self.force_mmap,
        }
    }

    pub const fn with_force_mmap(self, force_mmap: bool) -> Self {
        AllocateOptions {
            align: self.align,
            zero: self.zero,
            force_mmap,
        }
    }
}

// Whether the brk arena participates at all. Compile-time presence is the
// `brk` feature; this runtime switch lets a process that hosts another brk
// user (typically the system malloc, when this crate is used as a library
// rather than as the global allocator) opt out before first use.
static USE_BRK: AtomicBool = AtomicBool::new(true);

/// Keep this allocator away from the program break. Must be called before
/// the first allocation; the brk arena never shrinks back out of the
/// address range it has claimed.
pub fn disable_brk() {
    USE_BRK.store(false, Ordering::Relaxed);
}

#[inline]
pub(crate) fn brk_enabled() -> bool {
    cfg!(feature = "brk") && USE_BRK.load(Ordering::Relaxed)
}
