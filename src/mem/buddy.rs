//! Implementation of a Buddy Allocator that is responsible for allocating
//! the physical memory that will then be used by either the slab allocator
//! to allocate objects, or directly by the kernel.
//!
//! Free blocks live in one pool per order. Every pool is a list of block
//! heads plus a lock. Whenever more than one pool lock is held, the locks were
//! taken in ascending order, which is what keeps concurrent splits and merges
//! from deadlocking each other. Page locks are always taken after pool locks
//! and two page locks only ever through [`PageTable::lock_two`].
//!
//! A block of order `n` and its buddy differ only in bit `n + PAGE_SHIFT` of
//! their physical address:
//!
//! ```text
//! +-- block
//! v
//! +---------------------------------+
//! |    block       |    buddy       |
//! +---------------------------------+
//!                  ^
//!                  +--- block ^ size_for_order(n)
//! ```

use super::{
    align_down, align_up,
    list::List,
    page::{BuddyState, Page, PageFlags, PageKind, PageTable},
    percpu::{self, PerCpuPages, Spill, PCP_MAX_ORDER},
    size_for_order, Config, Error, Result, JUNK_BYTE, MAX_ORDER, NCPU, ORDER_COUNT, PAGE_SIZE,
};
use crate::{
    arch::Harts,
    sync::{IrqGuard, SpinLock, SpinLockGuard},
    unit,
};
use core::{
    fmt, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};
use log::{debug, info, trace};

/// The central structure that is responsible for allocating
/// physical pages using the buddy allocation algorithm.
pub struct BuddySystem {
    table: PageTable,
    pools: [SpinLock<List>; ORDER_COUNT],
    cpus: [PerCpuPages; NCPU],
    harts: &'static dyn Harts,
    config: Config,
    total_pages: AtomicUsize,
}

impl BuddySystem {
    /// Create an empty buddy system over the pages of `table`.
    ///
    /// No memory is available until [`init`](Self::init) is called.
    ///
    /// # Safety
    ///
    /// The pages described by `table` must not be used by anything else, and
    /// must be readable and writable at their physical address for the whole
    /// lifetime of the buddy system.
    pub unsafe fn new(table: PageTable, harts: &'static dyn Harts, config: Config) -> Self {
        Self {
            table,
            pools: core::array::from_fn(|_| SpinLock::new(List::new())),
            cpus: percpu::caches(),
            harts,
            config,
            total_pages: AtomicUsize::new(0),
        }
    }

    /// Makes the memory in `start..end` available for allocation.
    ///
    /// Pages of the table outside the range are reserved and can never be
    /// allocated. The range is carved into the largest naturally aligned
    /// blocks that fit.
    ///
    /// Returns the number of pages that were added.
    pub fn init(&self, start: usize, end: usize) -> Result<usize> {
        if end < start {
            return Err(Error::InvalidRegion);
        }

        let start = align_up(start, PAGE_SIZE);
        let end = align_down(end, PAGE_SIZE);
        if start < self.table.base() || end > self.table.end() {
            return Err(Error::InvalidRegion);
        }
        if end.saturating_sub(start) < PAGE_SIZE {
            return Err(Error::RegionTooSmall);
        }

        for page in self.table.pages() {
            if page.phys() < start || page.phys() >= end {
                let mut meta = page.lock();
                meta.kind = PageKind::Reserved;
                meta.locked = true;
            }
        }

        let mut addr = start;
        let mut added = 0;
        while addr < end {
            let mut order = MAX_ORDER;
            while order > 0
                && (addr % size_for_order(order) != 0 || end - addr < size_for_order(order))
            {
                order -= 1;
            }

            let head = self.table.index_of(addr).ok_or(Error::InvalidRegion)?;
            self.stamp_block(head, order, BuddyState::Free);
            self.pools[order].lock().push_back(&self.table, head);
            trace!("Adding block at {:#x} with order {} to Buddy System", addr, order);

            addr += size_for_order(order);
            added += 1 << order;
        }

        self.total_pages.fetch_add(added, Ordering::Relaxed);
        debug!(
            "Buddy System manages {:#x}..{:#x} ({})",
            start,
            end,
            unit::bytes(added * PAGE_SIZE)
        );
        Ok(added)
    }

    /// Returns the page descriptor table.
    pub fn table(&self) -> &PageTable {
        &self.table
    }

    /// Returns the hart accessor.
    pub fn harts(&self) -> &'static dyn Harts {
        self.harts
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the id of the current hart.
    pub fn cpu_id(&self) -> usize {
        let id = self.harts.hart_id();
        assert!(id < NCPU, "hart {} exceeds the number of supported harts", id);
        id
    }

    /// Allocates a block of `2^order` pages.
    ///
    /// The block is aligned to its size, has a reference count of one and
    /// every page of it is stamped with the type given in `flags`.
    pub fn alloc(&self, order: usize, flags: PageFlags) -> Result<&'static Page> {
        if order > MAX_ORDER {
            return Err(Error::OrderTooLarge);
        }
        let kind = PageKind::for_alloc(flags, order)?;

        let _irq = IrqGuard::new(self.harts);
        let head = if self.cacheable(order) {
            self.cache_take(order)?
        } else {
            self.take(order)?
        };
        self.claim(head, order, kind);

        #[cfg(feature = "sanitizer")]
        self.check_integrity();

        Ok(self.table.page(head))
    }

    /// Drops the reference the caller holds to the block at `page`.
    ///
    /// Once the last reference is gone the block is returned to the buddy
    /// system. Freeing a block with the wrong order, an unaligned block, a
    /// locked block, or a block that isn't allocated is a fatal error.
    pub fn free(&self, page: &Page, order: usize) {
        assert!(
            order <= MAX_ORDER,
            "free: order {} exceeds the maximum order",
            order
        );
        let phys = page.phys();
        assert!(
            phys % size_for_order(order) == 0,
            "free: block {:#x} is not aligned to order {}",
            phys,
            order
        );

        let meta = *page.lock();
        match meta.kind.allocated_order() {
            Some(allocated) if allocated == order => {}
            Some(allocated) => panic!(
                "free: block {:#x} was allocated with order {}, but freed with order {}",
                phys, allocated, order
            ),
            None => panic!(
                "free: block {:#x} is not allocated ({:?}), double free?",
                phys, meta.kind
            ),
        }

        match page.ref_dec() {
            Ok(0) => self.release(self.table.index_of_page(page), order),
            Ok(_) => {}
            Err(_) => panic!("free: block {:#x} has no references, double free?", phys),
        }
    }

    /// Takes another reference to `page` and returns the new count.
    pub fn ref_inc(&self, page: &Page) -> Result<i32> {
        page.ref_inc()
    }

    /// Drops a reference to `page` and returns the new count.
    ///
    /// The block goes back to the buddy system when the count reaches zero.
    /// Dropping a reference of an unreferenced page fails without changing anything.
    pub fn ref_dec(&self, page: &Page) -> Result<i32> {
        let order = page.kind().allocated_order();
        let count = page.ref_dec()?;
        if count == 0 {
            let order = order.unwrap_or_else(|| {
                panic!(
                    "ref_dec: page {:#x} was referenced, but not allocated",
                    page.phys()
                )
            });
            self.release(self.table.index_of_page(page), order);
        }
        Ok(count)
    }

    /// Returns the reference count of `page`.
    pub fn ref_count(&self, page: &Page) -> i32 {
        page.ref_count()
    }

    /// Like [`alloc`](Self::alloc), but returns the physical address.
    pub fn alloc_pa(&self, order: usize, flags: PageFlags) -> Result<usize> {
        let page = self.alloc(order, flags)?;
        if self.config.junk_fill {
            // SAFETY
            // The block was just allocated, so it's ours, and the safety
            // contract of `new` says it's mapped at its physical address.
            unsafe { ptr::write_bytes(page.phys() as *mut u8, JUNK_BYTE, size_for_order(order)) };
        }
        Ok(page.phys())
    }

    /// Like [`free`](Self::free), but takes the physical address of the block.
    pub fn free_pa(&self, pa: usize, order: usize) -> Result<()> {
        let page = self.table.pa_to_page(pa).ok_or(Error::InvalidAddress)?;
        self.free(page, order);
        Ok(())
    }

    /// Sets or clears the locked bit of an allocated page.
    ///
    /// Locked pages can't be freed.
    pub fn set_page_locked(&self, pa: usize, locked: bool) -> Result<()> {
        let page = self.table.pa_to_page(pa).ok_or(Error::InvalidAddress)?;
        let mut meta = page.lock();
        if meta.kind.allocated_order().is_none() {
            return Err(Error::NotReferenced);
        }
        meta.locked = locked;
        Ok(())
    }

    /// Moves every block cached by the current hart back into the pools.
    ///
    /// Returns the number of blocks that were moved.
    pub fn drain_percpu(&self) -> usize {
        let _irq = IrqGuard::new(self.harts);
        let cpu = self.cpu_id();

        let mut drained = 0;
        for order in 0..=PCP_MAX_ORDER {
            let spill = self.cpus[cpu].with_list(self.harts, order, |list| {
                let mut spill = Spill::new();
                while let Some(head) = list.pop_front(&self.table) {
                    spill.push(head);
                }
                spill
            });

            drained += spill.len();
            spill.iter().for_each(|head| self.merge(head, order));
        }

        debug!("Drained {} cached blocks of hart {}", drained, cpu);
        drained
    }

    /// Returns a snapshot of the pool and cache population.
    pub fn stat(&self) -> BuddyStat {
        let pools: [SpinLockGuard<'_, List>; ORDER_COUNT] =
            core::array::from_fn(|order| self.pools[order].lock());

        let mut stat = BuddyStat {
            free: [0; ORDER_COUNT],
            cached: [0; ORDER_COUNT],
            total_pages: self.total_pages.load(Ordering::Relaxed),
        };
        for (order, pool) in pools.iter().enumerate() {
            stat.free[order] = pool.len();
        }
        for cpu in &self.cpus {
            for order in 0..=PCP_MAX_ORDER {
                stat.cached[order] += cpu.cached(order);
            }
        }
        stat
    }

    /// Returns the number of free pages, including cached ones.
    pub fn free_pages(&self) -> usize {
        self.stat().free_pages()
    }

    /// Logs the current statistics.
    ///
    /// The detailed form also lists the address of every free block.
    pub fn print_stat(&self, detailed: bool) {
        info!("{}", self.stat());

        if detailed {
            for (order, pool) in self.pools.iter().enumerate() {
                let pool = pool.lock();
                for head in pool.iter(&self.table) {
                    info!("order {:>2}: {:#x}", order, self.table.page(head).phys());
                }
            }
        }
    }

    /// Walks all pools and panics if any free block is inconsistent.
    ///
    /// Returns the number of free pages inside the pools.
    pub fn check_integrity(&self) -> usize {
        let pools: [SpinLockGuard<'_, List>; ORDER_COUNT] =
            core::array::from_fn(|order| self.pools[order].lock());

        let mut free = 0;
        for (order, pool) in pools.iter().enumerate() {
            let mut len = 0;
            for head in pool.iter(&self.table) {
                let page = self.table.page(head);
                let expected = PageKind::BuddyHead {
                    order: order as u8,
                    state: BuddyState::Free,
                };
                assert_eq!(
                    page.kind(),
                    expected,
                    "pool {} holds inconsistent block {:#x}",
                    order,
                    page.phys()
                );
                assert!(
                    page.phys() % size_for_order(order) == 0,
                    "pool {} holds unaligned block {:#x}",
                    order,
                    page.phys()
                );

                for tail in head + 1..head + (1 << order) {
                    assert_eq!(
                        self.table.page(tail).kind(),
                        PageKind::BuddyTail { head },
                        "tail {:#x} of block {:#x} doesn't point to its head",
                        self.table.page(tail).phys(),
                        page.phys()
                    );
                }
                len += 1;
            }

            assert_eq!(len, pool.len(), "pool {} has a wrong count", order);
            free += len << order;
        }
        free
    }

    fn cacheable(&self, order: usize) -> bool {
        self.config.percpu_cache && order <= PCP_MAX_ORDER
    }

    /// Takes a block out of the current hart's cache, refilling the cache
    /// from the pools on a miss.
    fn cache_take(&self, order: usize) -> Result<usize> {
        let cpu = self.cpu_id();
        self.cpus[cpu].with_list(self.harts, order, |list| {
            if let Some(head) = list.pop_front(&self.table) {
                return Ok(head);
            }

            let head = self.take(order)?;
            for _ in 1..percpu::batch(order) {
                match self.take(order) {
                    Ok(extra) => {
                        self.transition(extra, order, BuddyState::Merging, BuddyState::Cached);
                        list.push_back(&self.table, extra);
                    }
                    Err(_) => break,
                }
            }

            trace!(
                "Refilled order {} cache of hart {} with {} blocks",
                order,
                cpu,
                list.len()
            );
            Ok(head)
        })
    }

    /// Puts a free block into the current hart's cache.
    ///
    /// Returns `false` if the block can't be cached.
    fn cache_put(&self, head: usize, order: usize) -> bool {
        if !self.cacheable(order) {
            return false;
        }

        self.stamp_block(head, order, BuddyState::Cached);
        let cpu = self.cpu_id();
        let spill = self.cpus[cpu].with_list(self.harts, order, |list| {
            list.push_back(&self.table, head);

            let mut spill = Spill::new();
            if list.len() > percpu::high(order) {
                while spill.len() < percpu::batch(order) {
                    match list.pop_front(&self.table) {
                        Some(head) => spill.push(head),
                        None => break,
                    }
                }
            }
            spill
        });

        // the pools are only touched after the cache is released
        spill.iter().for_each(|head| self.merge(head, order));
        true
    }

    /// Takes a block of `order` out of the pools, splitting a larger one if needed.
    ///
    /// The returned block is in the `Merging` state and on no list.
    fn take(&self, order: usize) -> Result<usize> {
        let mut pools: [Option<SpinLockGuard<'_, List>>; ORDER_COUNT] = Default::default();

        // lock pools in ascending order until we find one with a block
        let mut found = None;
        for current in order..=MAX_ORDER {
            let pool = self.pools[current].lock();
            let empty = pool.is_empty();
            pools[current] = Some(pool);
            if !empty {
                found = Some(current);
                break;
            }
        }

        let from = found.ok_or(Error::NoMemoryAvailable)?;
        let head = pools[from]
            .as_mut()
            .and_then(|pool| pool.pop_front(&self.table))
            .ok_or(Error::NoMemoryAvailable)?;
        self.transition(head, from, BuddyState::Free, BuddyState::Merging);

        // walk down the orders, freeing the upper half on every split
        for target in (order..from).rev() {
            let upper = head + (1 << target);
            self.stamp_block(upper, target, BuddyState::Free);
            match pools[target].as_mut() {
                Some(pool) => pool.push_back(&self.table, upper),
                None => unreachable!("pool {} was locked above", target),
            }

            trace!(
                "Split block {:#x} of order {}, buddy {:#x} is free",
                self.table.page(head).phys(),
                target + 1,
                self.table.page(upper).phys()
            );
        }

        // the tails of the lower half still point to `head`
        self.table.page(head).lock().kind = PageKind::BuddyHead {
            order: order as u8,
            state: BuddyState::Merging,
        };
        Ok(head)
    }

    /// Returns a block whose last reference was dropped.
    fn release(&self, head: usize, order: usize) {
        let _irq = IrqGuard::new(self.harts);

        for idx in head..head + (1 << order) {
            let page = self.table.page(idx);
            assert!(
                !page.lock().locked,
                "free: page {:#x} is locked and can't be freed",
                page.phys()
            );
            assert_eq!(
                page.ref_count(),
                0,
                "free: page {:#x} is still referenced",
                page.phys()
            );
        }

        if !self.cache_put(head, order) {
            self.merge(head, order);
        }

        #[cfg(feature = "sanitizer")]
        self.check_integrity();
    }

    /// Merges a block that is on no list with its free buddies and puts the
    /// result into its pool.
    fn merge(&self, mut head: usize, mut order: usize) {
        self.table.page(head).lock().kind = PageKind::BuddyHead {
            order: order as u8,
            state: BuddyState::Merging,
        };

        loop {
            let mut pool = self.pools[order].lock();

            if let Some(buddy) = self.buddy_of(head, order) {
                let (ours, mut theirs) = self.table.lock_two(head, buddy);
                let free = PageKind::BuddyHead {
                    order: order as u8,
                    state: BuddyState::Free,
                };

                if theirs.kind == free && !theirs.locked {
                    // both halves are in transit now, nobody else can merge them
                    theirs.kind = PageKind::BuddyHead {
                        order: order as u8,
                        state: BuddyState::Merging,
                    };
                    debug_assert!(matches!(
                        ours.kind,
                        PageKind::BuddyHead {
                            state: BuddyState::Merging,
                            ..
                        }
                    ));
                    drop((ours, theirs));
                    pool.remove(&self.table, buddy);
                    drop(pool);

                    trace!(
                        "Merged block {:#x} with buddy {:#x} at order {}",
                        self.table.page(head).phys(),
                        self.table.page(buddy).phys(),
                        order
                    );

                    head = head.min(buddy);
                    order += 1;
                    self.table.page(head).lock().kind = PageKind::BuddyHead {
                        order: order as u8,
                        state: BuddyState::Merging,
                    };
                    continue;
                }
            }

            self.stamp_block(head, order, BuddyState::Free);
            pool.push_back(&self.table, head);
            break;
        }
    }

    /// Returns the index of the buddy of the block at `head`,
    /// if the buddy is managed by this table.
    fn buddy_of(&self, head: usize, order: usize) -> Option<usize> {
        if order >= MAX_ORDER {
            return None;
        }
        let phys = self.table.page(head).phys();
        self.table.index_of(phys ^ size_for_order(order))
    }

    /// Stamps the block at `head` as a buddy block in the given state.
    fn stamp_block(&self, head: usize, order: usize, state: BuddyState) {
        for idx in head + 1..head + (1 << order) {
            self.table.page(idx).lock().kind = PageKind::BuddyTail { head };
        }
        self.table.page(head).lock().kind = PageKind::BuddyHead {
            order: order as u8,
            state,
        };
    }

    fn transition(&self, head: usize, order: usize, from: BuddyState, to: BuddyState) {
        let page = self.table.page(head);
        let mut meta = page.lock();
        let expected = PageKind::BuddyHead {
            order: order as u8,
            state: from,
        };
        assert_eq!(
            meta.kind,
            expected,
            "block {:#x} is in an unexpected state",
            page.phys()
        );
        meta.kind = PageKind::BuddyHead {
            order: order as u8,
            state: to,
        };
    }

    /// Hands the in-transit block at `head` to its new owner.
    fn claim(&self, head: usize, order: usize, kind: PageKind) {
        let page = self.table.page(head);
        match page.kind() {
            PageKind::BuddyHead {
                order: o,
                state: BuddyState::Merging,
            }
            | PageKind::BuddyHead {
                order: o,
                state: BuddyState::Cached,
            } if o as usize == order => {}
            kind => panic!(
                "alloc: block {:#x} of order {} is in state {:?}",
                page.phys(),
                order,
                kind
            ),
        }

        assert_eq!(
            page.ref_count(),
            0,
            "alloc: free block {:#x} is referenced",
            page.phys()
        );
        self.table.stamp(head, order, kind);
        page.set_ref_count(1);
    }
}

/// A snapshot of the buddy system population.
#[derive(Debug, Clone)]
pub struct BuddyStat {
    /// Number of free blocks in the pool of every order.
    pub free: [usize; ORDER_COUNT],
    /// Number of blocks of every order sitting in per-CPU caches.
    pub cached: [usize; ORDER_COUNT],
    /// The number of pages managed by the buddy system.
    pub total_pages: usize,
}

impl BuddyStat {
    /// Returns whether the pool of `order` is empty.
    pub fn is_empty(&self, order: usize) -> bool {
        self.free[order] == 0
    }

    /// Returns the number of free pages in pools and caches.
    pub fn free_pages(&self) -> usize {
        (0..ORDER_COUNT)
            .map(|order| (self.free[order] + self.cached[order]) << order)
            .sum()
    }
}

impl fmt::Display for BuddyStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = "Buddy System";
        writeln!(f, "{}", name)?;
        name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        for order in 0..ORDER_COUNT {
            writeln!(
                f,
                "order {:>2}: {:>6} free {:>4} cached{}",
                order,
                self.free[order],
                self.cached[order],
                if self.is_empty(order) { " (empty)" } else { "" }
            )?;
        }
        writeln!(f, "Free: {}", unit::bytes(self.free_pages() * PAGE_SIZE))?;
        writeln!(f, "Total: {}", unit::bytes(self.total_pages * PAGE_SIZE))?;
        name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem::PAGE_SHIFT, testing};
    use std::{string::ToString, vec::Vec};

    fn uncached() -> Config {
        Config {
            percpu_cache: false,
            ..Config::default()
        }
    }

    #[test]
    fn blocks_are_aligned_to_their_order() {
        let buddy = testing::buddy(1 << MAX_ORDER, uncached());
        for order in 0..=MAX_ORDER {
            let page = buddy.alloc(order, PageFlags::ANON).unwrap();
            assert_eq!(page.phys() % (1 << (order + PAGE_SHIFT)), 0);
            assert_eq!(page.ref_count(), 1);
            buddy.free(page, order);
        }
        assert_eq!(buddy.stat().free[MAX_ORDER], 1);
        buddy.check_integrity();
    }

    #[test]
    fn alloc_then_free_restores_pools() {
        let buddy = testing::buddy(64, uncached());
        let keep = buddy.alloc(0, PageFlags::ANON).unwrap();
        let before = buddy.stat().free;

        for order in 0..=3 {
            let page = buddy.alloc(order, PageFlags::PAGE_TABLE).unwrap();
            buddy.free(page, order);
            assert_eq!(buddy.stat().free, before);
        }

        buddy.free(keep, 0);
        assert_eq!(buddy.check_integrity(), 64);
    }

    #[test]
    fn four_pages_scenario() {
        let buddy = testing::buddy(4, uncached());
        assert_eq!(buddy.stat().free[2], 1);

        let pages: Vec<_> = (0..4)
            .map(|_| buddy.alloc(0, PageFlags::ANON).unwrap())
            .collect();
        assert_eq!(buddy.alloc(0, PageFlags::ANON).err(), Some(Error::NoMemoryAvailable));

        buddy.free(pages[1], 0);
        let stat = buddy.stat();
        assert_eq!(stat.free[0], 1);
        assert_eq!(stat.free_pages(), 1);

        buddy.free(pages[0], 0);
        buddy.free(pages[3], 0);
        buddy.free(pages[2], 0);
        let stat = buddy.stat();
        assert_eq!(stat.free, {
            let mut free = [0; ORDER_COUNT];
            free[2] = 1;
            free
        });
        buddy.check_integrity();
    }

    #[test]
    fn adjacent_buddies_coalesce() {
        let buddy = testing::buddy(8, uncached());
        let a = buddy.alloc(1, PageFlags::ANON).unwrap();
        let b = buddy.alloc(1, PageFlags::ANON).unwrap();
        assert_eq!(a.phys() ^ b.phys(), 2 * PAGE_SIZE);

        buddy.free(a, 1);
        assert_eq!(buddy.stat().free[1], 1);
        buddy.free(b, 1);
        assert_eq!(buddy.stat().free[1], 0);
        assert_eq!(buddy.stat().free[3], 1);
    }

    #[test]
    fn fragmentation_does_not_block_larger_blocks() {
        let buddy = testing::buddy(16, uncached());
        let big = buddy.alloc(2, PageFlags::ANON).unwrap();

        for _ in 0..100 {
            let small = buddy.alloc(0, PageFlags::ANON).unwrap();
            assert!(small.phys() < big.phys() || small.phys() >= big.phys() + 4 * PAGE_SIZE);
            buddy.free(small, 0);
        }

        let second = buddy.alloc(2, PageFlags::ANON).unwrap();
        assert_ne!(second.phys(), big.phys());
        buddy.free(second, 2);
        buddy.free(big, 2);
        assert_eq!(buddy.stat().free[4], 1);
    }

    #[test]
    fn shared_blocks_survive_until_last_reference() {
        let buddy = testing::buddy(4, uncached());
        let page = buddy.alloc(0, PageFlags::ANON).unwrap();
        assert_eq!(buddy.ref_inc(page), Ok(2));

        buddy.free(page, 0);
        assert_eq!(buddy.ref_count(page), 1);
        assert!(matches!(page.kind(), PageKind::Anon { order: 0 }));

        assert_eq!(buddy.ref_dec(page), Ok(0));
        assert_eq!(buddy.ref_dec(page), Err(Error::NotReferenced));
        assert_eq!(buddy.ref_count(page), 0);
        assert_eq!(buddy.stat().free[2], 1);
    }

    #[test]
    fn rejects_bad_arguments() {
        let buddy = testing::buddy(4, uncached());
        assert_eq!(
            buddy.alloc(MAX_ORDER + 1, PageFlags::ANON).err(),
            Some(Error::OrderTooLarge)
        );
        assert_eq!(
            buddy.alloc(0, PageFlags::LOCKED).err(),
            Some(Error::InvalidFlags)
        );
        assert_eq!(buddy.free_pa(0x10, 0), Err(Error::InvalidAddress));
    }

    #[test]
    #[should_panic(expected = "allocated with order 0, but freed with order 1")]
    fn free_with_wrong_order_panics() {
        let buddy = testing::buddy(4, uncached());
        let page = loop {
            let page = buddy.alloc(0, PageFlags::ANON).unwrap();
            if page.phys() % (2 * PAGE_SIZE) == 0 {
                break page;
            }
        };
        buddy.free(page, 1);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let buddy = testing::buddy(4, uncached());
        let page = buddy.alloc(0, PageFlags::ANON).unwrap();
        buddy.free(page, 0);
        buddy.free(page, 0);
    }

    #[test]
    #[should_panic(expected = "is locked")]
    fn locked_pages_cannot_be_freed() {
        let buddy = testing::buddy(4, uncached());
        let pa = buddy.alloc_pa(0, PageFlags::PAGE_CACHE).unwrap();
        buddy.set_page_locked(pa, true).unwrap();
        buddy.free_pa(pa, 0).unwrap();
    }

    #[test]
    fn reserves_pages_outside_the_range() {
        let base = testing::region(8, 8 * PAGE_SIZE);
        let table = testing::table(base, 8);
        let buddy = unsafe { BuddySystem::new(table, &testing::HARTS, uncached()) };
        assert_eq!(buddy.init(base + 2 * PAGE_SIZE, base + 7 * PAGE_SIZE), Ok(5));

        assert_eq!(table.page(0).kind(), PageKind::Reserved);
        assert!(table.page(7).lock().locked);
        assert_eq!(buddy.stat().free[0], 1);
        assert_eq!(buddy.stat().free[1], 2);
        assert_eq!(buddy.check_integrity(), 5);

        assert_eq!(buddy.init(base + 16 * PAGE_SIZE, base), Err(Error::InvalidRegion));
    }

    #[test]
    fn address_api_fills_junk() {
        let buddy = testing::buddy(4, uncached());
        let pa = buddy.alloc_pa(0, PageFlags::ANON).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(pa as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == JUNK_BYTE));
        buddy.free_pa(pa, 0).unwrap();
    }

    #[test]
    fn percpu_cache_serves_and_drains() {
        let buddy = testing::buddy(64, Config::default());
        let page = buddy.alloc(0, PageFlags::ANON).unwrap();

        let stat = buddy.stat();
        assert_eq!(stat.cached[0], percpu::batch(0) - 1);
        assert_eq!(stat.free_pages(), 63);

        buddy.free(page, 0);
        assert_eq!(buddy.stat().cached[0], percpu::batch(0));

        assert_eq!(buddy.drain_percpu(), percpu::batch(0));
        let stat = buddy.stat();
        assert_eq!(stat.cached[0], 0);
        assert_eq!(stat.free[6], 1);
        assert_eq!(buddy.check_integrity(), 64);
    }

    #[test]
    fn percpu_cache_spills_past_high_watermark() {
        let buddy = testing::buddy(256, Config::default());
        let pages: Vec<_> = (0..percpu::high(0) + 1)
            .map(|_| buddy.alloc(0, PageFlags::ANON).unwrap())
            .collect();
        pages.into_iter().for_each(|page| buddy.free(page, 0));

        let cached = buddy.stat().cached[0];
        assert!(cached <= percpu::high(0));
        assert_eq!(buddy.free_pages(), 256);

        buddy.drain_percpu();
        assert_eq!(buddy.stat().free[8], 1);
    }

    #[test]
    fn concurrent_alloc_free_keeps_pools_consistent() {
        let buddy = testing::buddy(512, Config::default());
        let threads: Vec<_> = (0..4)
            .map(|hart| {
                std::thread::spawn(move || {
                    testing::set_hart(hart);
                    for round in 0..200 {
                        let order = round % 4;
                        let page = buddy.alloc(order, PageFlags::ANON).unwrap();
                        unsafe { ptr::write_bytes(page.phys() as *mut u8, hart as u8, PAGE_SIZE) };
                        buddy.free(page, order);
                    }
                    buddy.drain_percpu();
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().unwrap());

        assert_eq!(buddy.check_integrity(), 512);
        assert_eq!(buddy.stat().free[9], 1);
    }

    #[test]
    fn stat_display_lists_orders() {
        let buddy = testing::buddy(4, uncached());
        let out = buddy.stat().to_string();
        assert!(out.starts_with("Buddy System\n~~~~~~~~~~~~\n"));
        assert!(out.contains("order  2:      1 free    0 cached\n"));
        assert!(out.contains("order  0:      0 free    0 cached (empty)\n"));
        buddy.print_stat(true);
    }
}
