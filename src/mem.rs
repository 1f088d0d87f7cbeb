//! Physical memory management.
//!
//! The memory core is layered, leaves first:
//!
//! - [`early`]: a single threaded boot allocator that hands out the page
//!   descriptor table and other fixed structures.
//! - [`page`]: one descriptor per physical page.
//! - [`buddy`]: the page allocator, with a per-CPU cache in [`percpu`].
//! - [`slab`]: fixed-size object caches carved out of buddy blocks.
//! - [`kmm`]: the general purpose small object allocator.

pub mod buddy;
pub mod early;
pub mod kmm;
pub mod list;
pub mod page;
pub mod percpu;
pub mod slab;

use crate::unit::KIB;
use displaydoc_lite::displaydoc;

/// Number of bits of the offset inside a page.
pub const PAGE_SHIFT: usize = 12;

/// The size of a single page in memory.
///
/// This is also used as the order-0 size inside
/// the buddy allocator.
pub const PAGE_SIZE: usize = 4 * KIB;

/// The maximum order for the buddy allocator (inclusive).
pub const MAX_ORDER: usize = 10;

/// The size of the orders array inside the buddy allocator.
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// The maximum number of harts that can use the allocators.
pub const NCPU: usize = 8;

/// Result for every memory allocation operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

displaydoc! {
    /// Any error that can happen while allocating or deallocating memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// tried to allocate an order that exceeded the maximum order.
        OrderTooLarge,
        /// the allocation flags contain bits that can't be used for allocation.
        InvalidFlags,
        /// tried to allocate, but there was no free memory left.
        NoMemoryAvailable,
        /// the address is not managed by this allocator.
        InvalidAddress,
        /// the page is not referenced by anyone.
        NotReferenced,
        /// the object size exceeds the maximum slab object size.
        ObjectTooLarge,
        /// tried to destroy a static cache.
        StaticCache,
        /// the cache still has live objects.
        CacheBusy,
        /// the pointer does not belong to a slab object.
        NotSlabObject,
        /// tried to add a region to an allocator that was too small.
        RegionTooSmall,
        /// the `end` of a memory region was before the `start`, or outside the managed memory.
        InvalidRegion,
    }
}

/// The byte written to freshly allocated pages when junk filling is enabled.
pub const JUNK_BYTE: u8 = 0x05;

/// Runtime tunables of the memory core.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Serve small orders from per-CPU caches before touching the pools.
    pub percpu_cache: bool,
    /// A cache starts shrinking once its free objects exceed
    /// this many slabs worth of objects.
    pub slab_shrink_multiple: usize,
    /// Fill pages returned by the address based API with [`JUNK_BYTE`].
    pub junk_fill: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            percpu_cache: true,
            slab_shrink_multiple: 4,
            junk_fill: true,
        }
    }
}

/// Aligns the given `addr` upwards to `align`.
///
/// `align` must be a power of two.
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Aligns the given `addr` downwards to `align`.
///
/// `align` must be a power of two.
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Calculates the size in bytes for the given order.
pub const fn size_for_order(order: usize) -> usize {
    PAGE_SIZE << order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_matches_shift() {
        assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);
        assert_eq!(size_for_order(MAX_ORDER), 4 * crate::unit::MIB);
    }

    #[test]
    fn aligns() {
        assert_eq!(align_up(0x1001, PAGE_SIZE), 0x2000);
        assert_eq!(align_up(0x2000, PAGE_SIZE), 0x2000);
        assert_eq!(align_down(0x2fff, PAGE_SIZE), 0x2000);
    }
}
