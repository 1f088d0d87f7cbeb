//! The memory core as one unit, and the global instance the kernel uses.
//!
//! [`Kmem`] wires the page table, buddy system, slab allocator and the kmm
//! ladder together. The free functions of this module operate on the global
//! instance installed by [`init`].

use crate::{
    arch::Harts,
    mem::{
        align_up,
        buddy::{BuddyStat, BuddySystem},
        early::EarlyAllocator,
        kmm::Kmm,
        page::{Page, PageFlags, PageTable},
        slab::{CacheFlags, CacheStat, SlabAllocator, SlabCache},
        Config, Error, Result, PAGE_SHIFT, PAGE_SIZE,
    },
    sync::Once,
    unit,
};
use core::{mem::MaybeUninit, ptr::NonNull};
use log::info;

/// Handles to every layer of one memory core.
#[derive(Clone, Copy)]
pub struct Kmem {
    buddy: &'static BuddySystem,
    slabs: &'static SlabAllocator,
    kmm: &'static Kmm,
}

impl Kmem {
    /// Builds the memory core for the physical range `base..end`.
    ///
    /// The page descriptor table and all allocator structures are taken from
    /// `early`. Everything `early` has not handed out when this function
    /// is done becomes free memory of the buddy system, so `early` must
    /// not be used afterwards.
    ///
    /// # Safety
    ///
    /// `early` must allocate from inside `base..end`, and the whole range
    /// must be usable memory, mapped at its physical address.
    pub unsafe fn boot(
        early: &mut EarlyAllocator,
        base: usize,
        end: usize,
        harts: &'static dyn Harts,
        config: Config,
    ) -> Result<Self> {
        if end <= base || base % PAGE_SIZE != 0 {
            return Err(Error::InvalidRegion);
        }
        let pages = (end - base) >> PAGE_SHIFT;

        let table = PageTable::init(early.alloc_array::<Page>(pages), base);
        let buddy: &'static BuddySystem = early.alloc_value(BuddySystem::new(table, harts, config));

        let slabs: &'static SlabAllocator = early.alloc_value(SlabAllocator::new(buddy)?);
        slabs.init();
        let kmm: &'static Kmm = early.alloc_value(Kmm::new(slabs)?);
        kmm.init();

        let start = align_up(early.end_ptr(), PAGE_SIZE);
        buddy.init(start, end)?;

        info!(
            "Memory core up with {} of {} free",
            unit::bytes(buddy.free_pages() * PAGE_SIZE),
            unit::bytes(end - base)
        );
        Ok(Self { buddy, slabs, kmm })
    }

    pub fn buddy(&self) -> &'static BuddySystem {
        self.buddy
    }

    pub fn slabs(&self) -> &'static SlabAllocator {
        self.slabs
    }

    pub fn kmm(&self) -> &'static Kmm {
        self.kmm
    }

    /// The page descriptor table.
    pub fn table(&self) -> &'static PageTable {
        self.buddy.table()
    }

    /// Allocates a single junk-filled page.
    pub fn kalloc(&self) -> Result<NonNull<u8>> {
        let pa = self.buddy.alloc_pa(0, PageFlags::ANON)?;
        NonNull::new(pa as *mut u8).ok_or(Error::InvalidAddress)
    }

    /// Drops a reference to a page returned by [`kalloc`](Self::kalloc).
    ///
    /// # Safety
    ///
    /// `ptr` must not be used anymore if this was the last reference.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>) {
        let pa = ptr.as_ptr() as usize;
        let page = self
            .table()
            .pa_to_page(pa)
            .unwrap_or_else(|| panic!("kfree: {:#x} is not managed memory", pa));

        if self.buddy.ref_dec(page).is_err() {
            panic!("kfree: page {:#x} is not referenced", pa);
        }
    }

    /// Returns the descriptor of the page containing `pa`.
    pub fn page(&self, pa: usize) -> Result<&'static Page> {
        self.table().pa_to_page(pa).ok_or(Error::InvalidAddress)
    }
}

static KMEM: Once<Kmem> = Once::new();

/// Builds the global memory core. See [`Kmem::boot`].
///
/// # Safety
///
/// See [`Kmem::boot`]. Must be called exactly once, before any other
/// function of this module.
pub unsafe fn init(
    early: &mut EarlyAllocator,
    base: usize,
    end: usize,
    harts: &'static dyn Harts,
    config: Config,
) -> Result<&'static Kmem> {
    assert!(KMEM.get().is_none(), "memory core initialized twice");
    let kmem = Kmem::boot(early, base, end, harts, config)?;
    Ok(KMEM.call_once(|| kmem))
}

/// Returns the global memory core.
pub fn kmem() -> &'static Kmem {
    KMEM
        .get()
        .unwrap_or_else(|| panic!("memory core used before initialization"))
}

/// Allocates a block of `2^order` pages and returns its physical address.
pub fn page_alloc(order: usize, flags: PageFlags) -> Result<usize> {
    kmem().buddy.alloc_pa(order, flags)
}

/// Drops a reference to the block at `pa`.
pub fn page_free(pa: usize, order: usize) -> Result<()> {
    kmem().buddy.free_pa(pa, order)
}

/// Allocates a block of `2^order` pages and returns its first descriptor.
pub fn __page_alloc(order: usize, flags: PageFlags) -> Result<&'static Page> {
    kmem().buddy.alloc(order, flags)
}

/// Drops a reference to the block starting at `page`.
pub fn __page_free(page: &Page, order: usize) {
    kmem().buddy.free(page, order)
}

/// Takes another reference to the page containing `pa`.
pub fn page_ref_inc(pa: usize) -> Result<i32> {
    let kmem = kmem();
    kmem.buddy.ref_inc(kmem.page(pa)?)
}

/// Drops a reference to the page containing `pa`, freeing it at zero.
pub fn page_ref_dec(pa: usize) -> Result<i32> {
    let kmem = kmem();
    kmem.buddy.ref_dec(kmem.page(pa)?)
}

pub fn page_ref_count(page: &Page) -> i32 {
    kmem().buddy.ref_count(page)
}

/// Sets or clears the locked bit of the page containing `pa`.
pub fn set_page_locked(pa: usize, locked: bool) -> Result<()> {
    kmem().buddy.set_page_locked(pa, locked)
}

pub fn page_buddy_stat() -> BuddyStat {
    kmem().buddy.stat()
}

pub fn print_buddy_system_stat(detailed: bool) {
    kmem().buddy.print_stat(detailed)
}

/// Allocates a single junk-filled page.
pub fn kalloc() -> Result<NonNull<u8>> {
    kmem().kalloc()
}

/// Frees a page returned by [`kalloc`].
///
/// # Safety
///
/// See [`Kmem::kfree`].
pub unsafe fn kfree(ptr: NonNull<u8>) {
    kmem().kfree(ptr)
}

/// Allocates at least `size` bytes from the kmm ladder.
pub fn kmm_alloc(size: usize) -> Result<NonNull<u8>> {
    kmem().kmm.alloc(size)
}

/// Frees memory returned by [`kmm_alloc`].
///
/// # Safety
///
/// `ptr` must not be used anymore.
pub unsafe fn kmm_free(ptr: NonNull<u8>) -> Result<()> {
    kmem().kmm.free(ptr)
}

/// Returns unused slabs of every cache to the buddy system.
pub fn kmm_shrink_all() -> usize {
    kmem().kmm.shrink_all()
}

pub fn slab_cache_create(
    name: &'static str,
    obj_size: usize,
    flags: CacheFlags,
) -> Result<&'static SlabCache> {
    kmem().slabs.cache_create(name, obj_size, flags)
}

pub fn slab_cache_init(
    storage: &'static mut MaybeUninit<SlabCache>,
    name: &'static str,
    obj_size: usize,
    flags: CacheFlags,
) -> Result<&'static SlabCache> {
    kmem().slabs.cache_init(storage, name, obj_size, flags)
}

/// # Safety
///
/// See [`SlabAllocator::cache_destroy`].
pub unsafe fn slab_cache_destroy(cache: &'static SlabCache) -> Result<()> {
    kmem().slabs.cache_destroy(cache)
}

pub fn slab_cache_shrink(cache: &SlabCache, count: usize) -> usize {
    cache.shrink(count)
}

pub fn slab_cache_stat(cache: &SlabCache) -> CacheStat {
    cache.stat()
}

pub fn slab_alloc(cache: &SlabCache) -> Result<NonNull<u8>> {
    cache.alloc()
}

/// # Safety
///
/// See [`SlabAllocator::free`].
pub unsafe fn slab_free(obj: NonNull<u8>) -> Result<()> {
    kmem().slabs.free(obj)
}

/// # Safety
///
/// See [`SlabAllocator::free`].
pub unsafe fn slab_free_noshrink(obj: NonNull<u8>) -> Result<()> {
    kmem().slabs.free_noshrink(obj)
}

pub fn slab_shrink_all() -> usize {
    kmem().slabs.shrink_all()
}

pub fn slab_dump_all() {
    kmem().slabs.dump_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mem::{early::EarlyAllocator, JUNK_BYTE, MAX_ORDER},
        testing,
    };

    #[test]
    fn boot_hands_the_rest_to_the_buddy_system() {
        let kmem = testing::kmem(1024, Config::default());
        let table = kmem.table();
        assert_eq!(table.len(), 1024);

        let reserved = table.pages().iter().filter(|page| page.lock().locked).count();
        assert!(reserved > 0 && reserved < 64);
        assert_eq!(kmem.buddy().free_pages(), 1024 - reserved);
        assert_eq!(kmem.buddy().check_integrity(), 1024 - reserved);
    }

    #[test]
    fn boot_rejects_bad_ranges() {
        let base = testing::region(16, PAGE_SIZE);
        unsafe {
            let mut early = EarlyAllocator::new(base, base + 16 * PAGE_SIZE);
            let res = Kmem::boot(&mut early, base + 16 * PAGE_SIZE, base, &testing::HARTS, Config::default());
            assert_eq!(res.err(), Some(Error::InvalidRegion));
        }
    }

    #[test]
    fn kalloc_pages_are_junk_filled() {
        let kmem = testing::kmem(64, Config::default());
        let page = kmem.kalloc().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == JUNK_BYTE));

        let before = kmem.buddy().free_pages();
        unsafe { kmem.kfree(page) };
        assert_eq!(kmem.buddy().free_pages(), before + 1);
    }

    #[test]
    #[should_panic(expected = "is not referenced")]
    fn kfree_of_a_free_page_panics() {
        let kmem = testing::kmem(64, Config::default());
        let page = kmem.kalloc().unwrap();
        unsafe {
            kmem.kfree(page);
            kmem.kfree(page);
        }
    }

    // the only test touching the global instance
    #[test]
    fn global_facade_serves_all_layers() {
        let pages = 1 << MAX_ORDER;
        let base = testing::region(pages, PAGE_SIZE);
        let end = base + pages * PAGE_SIZE;
        let kmem = unsafe {
            let mut early = EarlyAllocator::new(base, end);
            init(&mut early, base, end, &testing::HARTS, Config::default()).unwrap()
        };
        assert!(core::ptr::eq(kmem, super::kmem()));

        let pa = page_alloc(1, PageFlags::PAGE_TABLE).unwrap();
        assert_eq!(page_ref_inc(pa), Ok(2));
        assert_eq!(page_ref_dec(pa), Ok(1));
        let page = kmem.page(pa).unwrap();
        assert_eq!(page_ref_count(page), 1);
        page_free(pa, 1).unwrap();
        assert_eq!(page_ref_count(page), 0);
        assert_eq!(page_ref_dec(pa), Err(Error::NotReferenced));

        let page = __page_alloc(0, PageFlags::ANON).unwrap();
        __page_free(page, 0);

        let obj = kmm_alloc(100).unwrap();
        unsafe { kmm_free(obj).unwrap() };

        let cache = slab_cache_create("facade", 48, CacheFlags::empty()).unwrap();
        let obj = slab_alloc(cache).unwrap();
        assert_eq!(slab_cache_stat(cache).obj_active, 1);
        unsafe {
            assert_eq!(slab_cache_destroy(cache), Err(Error::CacheBusy));
            slab_free(obj).unwrap();
            assert_eq!(slab_cache_destroy(cache), Ok(()));
        }

        assert!(kmm_shrink_all() >= 1);
        assert_eq!(slab_shrink_all(), 0);
        slab_dump_all();
        print_buddy_system_stat(false);
        assert!(page_buddy_stat().free_pages() > 0);
    }
}
