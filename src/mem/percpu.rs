//! Per-CPU caches of small buddy blocks.
//!
//! Each hart keeps a short list of free blocks for every order up to
//! [`PCP_MAX_ORDER`]. Order 0 is the hottest path and is only ever touched by
//! its own hart with interrupts disabled, so it needs no lock. The other
//! orders sit behind a per-CPU spinlock.

use super::{list::List, NCPU};
use crate::{
    arch::Harts,
    sync::{LocalCell, SpinLock},
};
use core::sync::atomic::{AtomicUsize, Ordering};

/// The largest order that is cached per CPU.
pub const PCP_MAX_ORDER: usize = 8;

/// The high watermark of the order 0 cache. Higher orders cache fewer blocks.
pub const PCP_HIGH: usize = 64;

/// Returns how many blocks of `order` a cache holds before it spills.
pub const fn high(order: usize) -> usize {
    let high = PCP_HIGH >> order;
    if high < 2 {
        2
    } else {
        high
    }
}

/// Returns how many blocks move between a cache and the pools at once.
pub const fn batch(order: usize) -> usize {
    high(order) / 2
}

/// The caches of a single hart.
pub(super) struct PerCpuPages {
    order0: LocalCell<List>,
    orders: [SpinLock<List>; PCP_MAX_ORDER],
    cached: [AtomicUsize; PCP_MAX_ORDER + 1],
}

impl PerCpuPages {
    pub(super) fn new() -> Self {
        Self {
            order0: LocalCell::new(List::new()),
            orders: core::array::from_fn(|_| SpinLock::new(List::new())),
            cached: core::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    /// Runs `f` on the cache list of `order`.
    ///
    /// The caller must have interrupts disabled and run on the hart owning this cache.
    pub(super) fn with_list<R>(
        &self,
        harts: &dyn Harts,
        order: usize,
        f: impl FnOnce(&mut List) -> R,
    ) -> R {
        debug_assert!(order <= PCP_MAX_ORDER);
        let (ret, len) = if order == 0 {
            let mut list = self.order0.borrow(harts);
            let ret = f(&mut list);
            (ret, list.len())
        } else {
            let mut list = self.orders[order - 1].lock();
            let ret = f(&mut list);
            (ret, list.len())
        };

        self.cached[order].store(len, Ordering::Relaxed);
        ret
    }

    /// Returns how many blocks of `order` are cached right now.
    pub(super) fn cached(&self, order: usize) -> usize {
        self.cached[order].load(Ordering::Relaxed)
    }
}

/// Block heads taken out of a cache, waiting to be merged back into the pools.
pub(super) struct Spill {
    heads: [usize; PCP_HIGH],
    len: usize,
}

impl Spill {
    pub(super) fn new() -> Self {
        Self {
            heads: [0; PCP_HIGH],
            len: 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.len
    }

    pub(super) fn push(&mut self, head: usize) {
        assert!(self.len < PCP_HIGH, "per-cpu spill overflow");
        self.heads[self.len] = head;
        self.len += 1;
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.heads[..self.len].iter().copied()
    }
}

/// The caches of all harts.
pub(super) fn caches() -> [PerCpuPages; NCPU] {
    core::array::from_fn(|_| PerCpuPages::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_shrink_with_order() {
        assert_eq!(high(0), 64);
        assert_eq!(batch(0), 32);
        assert_eq!(high(3), 8);
        assert_eq!(high(PCP_MAX_ORDER), 2);
        assert_eq!(batch(PCP_MAX_ORDER), 1);
    }
}
