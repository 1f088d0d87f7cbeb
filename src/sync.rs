//! Synchronization primitives.
//!
//! Nothing in the memory core ever blocks. Every lock is taken by spinning,
//! and a lock that is spun on for too long is treated as a deadlock.

use crate::arch::Harts;
use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

pub use spin::Once;

/// Number of failed spins after which a lock is considered deadlocked.
pub const DEADLOCK_SPIN_LIMIT: u64 = 1 << 32;

/// A test-and-test-and-set spinlock that panics instead of spinning forever.
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        let mut spins = 0u64;
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                spins += 1;
                if spins >= DEADLOCK_SPIN_LIMIT {
                    panic!(
                        "spinlock at {:p}: possible deadlock after {} spins",
                        self, spins
                    );
                }
                core::hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// A spinning mutex with a deadlock heuristic.
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

/// RAII guard of a [`SpinLock`].
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

/// Creates a new [`SpinLock`] in const context.
pub const fn spin_lock<T>(value: T) -> SpinLock<T> {
    SpinLock::const_new(<RawSpinLock as lock_api::RawMutex>::INIT, value)
}

/// Keeps interrupts disabled on the current hart until dropped.
///
/// Guards nest, the outermost one restores the original state.
pub struct IrqGuard<'a> {
    harts: &'a dyn Harts,
    enabled: bool,
}

impl<'a> IrqGuard<'a> {
    /// Disable interrupts on the current hart.
    pub fn new(harts: &'a dyn Harts) -> Self {
        let enabled = harts.disable_interrupts();
        Self { harts, enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.harts.restore_interrupts(self.enabled);
    }
}

/// Data that only the hart owning it touches, with interrupts disabled.
///
/// Access is not serialized by a lock. A second borrow while the first is
/// alive means two harts share the data or an interrupt handler re-entered,
/// both of which are fatal.
pub struct LocalCell<T> {
    borrowed: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for LocalCell<T> {}

impl<T> LocalCell<T> {
    /// Create a new cell holding `value`.
    pub const fn new(value: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Disable interrupts and borrow the value mutably.
    pub fn borrow<'a>(&'a self, harts: &'a dyn Harts) -> LocalGuard<'a, T> {
        let irq = IrqGuard::new(harts);
        if self.borrowed.swap(true, Ordering::Acquire) {
            panic!(
                "per-cpu data at {:p} borrowed twice on hart {}",
                self,
                harts.hart_id()
            );
        }

        LocalGuard {
            cell: self,
            _irq: irq,
        }
    }
}

/// Mutable borrow of a [`LocalCell`].
pub struct LocalGuard<'a, T> {
    cell: &'a LocalCell<T>,
    _irq: IrqGuard<'a>,
}

impl<T> Deref for LocalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY
        // The `borrowed` flag guarantees that this is the only guard.
        unsafe { &*self.cell.value.get() }
    }
}

impl<T> DerefMut for LocalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY
        // The `borrowed` flag guarantees that this is the only guard.
        unsafe { &mut *self.cell.value.get() }
    }
}

impl<T> Drop for LocalGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.borrowed.store(false, Ordering::Release);
    }
}
