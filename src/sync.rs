// Locking substrate. The normal build uses spin locks; the
// single-threaded build turns every lock into a no-op so that the
// allocator has zero synchronization cost in processes that promise to
// stay on one thread.

#[cfg(not(feature = "single-threaded"))]
pub(crate) use spin::{Mutex, Once};

#[cfg(feature = "single-threaded")]
pub(crate) use nolock::Mutex;

#[cfg(feature = "single-threaded")]
mod nolock {
    use core::cell::UnsafeCell;
    use core::ops::{Deref, DerefMut};

    pub struct Mutex<T> {
        value: UnsafeCell<T>,
    }

    // The single-threaded feature is a caller promise that no second
    // thread ever enters the allocator.
    unsafe impl<T: Send> Sync for Mutex<T> {}
    unsafe impl<T: Send> Send for Mutex<T> {}

    impl<T> Mutex<T> {
        pub const fn new(value: T) -> Self {
            Mutex {
                value: UnsafeCell::new(value),
            }
        }

        #[inline]
        pub fn lock(&self) -> MutexGuard<'_, T> {
            MutexGuard {
                value: unsafe { &mut *self.value.get() },
            }
        }
    }

    pub struct MutexGuard<'a, T> {
        value: &'a mut T,
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;
        fn deref(&self) -> &T {
            self.value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            self.value
        }
    }
}
