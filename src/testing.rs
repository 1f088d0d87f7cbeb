//! Support for running the unit tests on the host.
//!
//! Fake physical memory is leaked host memory, so its "physical" addresses
//! can be dereferenced directly.

use crate::{
    arch::Harts,
    kmem::Kmem,
    mem::{
        buddy::BuddySystem,
        early::EarlyAllocator,
        page::{Page, PageTable},
        size_for_order, Config, MAX_ORDER, PAGE_SIZE,
    },
};
use std::{
    alloc::{self, Layout},
    boxed::Box,
    cell::Cell,
    vec::Vec,
};

std::thread_local! {
    static HART: Cell<usize> = Cell::new(0);
}

/// Hart ids are per test thread, interrupts don't exist.
pub struct TestHarts;

impl Harts for TestHarts {
    fn hart_id(&self) -> usize {
        HART.with(Cell::get)
    }

    fn disable_interrupts(&self) -> bool {
        false
    }

    fn restore_interrupts(&self, _enabled: bool) {}
}

pub static HARTS: TestHarts = TestHarts;

/// Sets the hart id of the calling thread.
pub fn set_hart(id: usize) {
    HART.with(|hart| hart.set(id));
}

/// Leaks `pages` zeroed pages aligned to `align` and returns their address.
pub fn region(pages: usize, align: usize) -> usize {
    let layout = Layout::from_size_align(pages * PAGE_SIZE, align.max(PAGE_SIZE))
        .expect("invalid test region layout");
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "failed to allocate {} test pages", pages);
    ptr as usize
}

/// Builds a page table for `pages` pages at `base`.
pub fn table(base: usize, pages: usize) -> PageTable {
    let descs: Vec<Page> = (0..pages)
        .map(|idx| Page::new(base + idx * PAGE_SIZE))
        .collect();
    PageTable::new(base, Box::leak(descs.into_boxed_slice()))
}

/// A buddy system managing a fresh region of `pages` pages.
///
/// The region is aligned so that it starts with the largest possible block.
pub fn buddy(pages: usize, config: Config) -> &'static BuddySystem {
    let base = region(pages, block_align(pages));
    let buddy = unsafe { BuddySystem::new(table(base, pages), &HARTS, config) };
    let buddy: &'static BuddySystem = Box::leak(Box::new(buddy));
    buddy
        .init(base, base + pages * PAGE_SIZE)
        .expect("failed to seed the test buddy system");
    buddy
}

/// A complete memory core booted inside a fresh region of `pages` pages.
pub fn kmem(pages: usize, config: Config) -> Kmem {
    let base = region(pages, block_align(pages));
    let end = base + pages * PAGE_SIZE;
    unsafe {
        let mut early = EarlyAllocator::new(base, end);
        Kmem::boot(&mut early, base, end, &HARTS, config).expect("failed to boot the test memory core")
    }
}

fn block_align(pages: usize) -> usize {
    (pages.next_power_of_two() * PAGE_SIZE).min(size_for_order(MAX_ORDER))
}
