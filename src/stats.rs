use core::sync::atomic::{AtomicI64, Ordering};

pub struct StatCount {
    allocated: AtomicI64,
    freed: AtomicI64,
    peak: AtomicI64,
    current: AtomicI64,
}

impl StatCount {
    const fn new() -> Self {
        StatCount {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    pub(crate) fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub(crate) fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    pub fn allocated(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> i64 {
        self.freed.load(Ordering::Relaxed)
    }
}

// Kernel interaction counters, maintained by the `os` layer.
pub struct Stats {
    pub mmap_calls: StatCount,
    pub brk_calls: StatCount,
    pub munmap_calls: StatCount,
    pub madvise_calls: StatCount,
    /// Bytes currently held in anonymous mappings (peak is the
    /// high-water mark).
    pub mapped_bytes: StatCount,
}

pub(crate) static STATS: Stats = Stats {
    mmap_calls: StatCount::new(),
    brk_calls: StatCount::new(),
    munmap_calls: StatCount::new(),
    madvise_calls: StatCount::new(),
    mapped_bytes: StatCount::new(),
};

/// Read-only view of the process-wide kernel call counters.
pub fn stats() -> &'static Stats {
    &STATS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_maximum() {
        let c = StatCount::new();
        c.increase(3);
        c.increase(2);
        c.decrease(4);
        c.increase(1);
        assert_eq!(c.current(), 2);
        assert_eq!(c.peak(), 5);
        assert_eq!(c.allocated(), 6);
        assert_eq!(c.freed(), 4);
    }
}
