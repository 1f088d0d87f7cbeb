//! The page descriptor table.
//!
//! Every physical page managed by the memory core has exactly one [`Page`].
//! What the page currently is, and the data that comes with that role, is a
//! single [`PageKind`] protected by the per-page lock. The reference count is
//! the one field that is changed without the lock.

use super::{
    list::{Link, Nodes},
    Error, Result, PAGE_SHIFT, PAGE_SIZE,
};
use crate::sync::{spin_lock, SpinLock, SpinLockGuard};
use bitflags::bitflags;
use core::{
    mem::MaybeUninit,
    sync::atomic::{AtomicI32, Ordering},
};

bitflags! {
    /// Flags that describe what a page is used for.
    ///
    /// The type flags are mutually exclusive. An empty set of flags means
    /// [`ANON`](PageFlags::ANON).
    pub struct PageFlags: u32 {
        /// Anonymous memory.
        const ANON = 1 << 0;
        /// Backing memory of a slab.
        const SLAB = 1 << 1;
        /// A page table.
        const PAGE_TABLE = 1 << 2;
        /// Page cache memory.
        const PAGE_CACHE = 1 << 3;
        /// The page may not be freed. Can only be set after allocation.
        const LOCKED = 1 << 26;

        /// All the type flags.
        const TYPE_MASK = Self::ANON.bits
            | Self::SLAB.bits
            | Self::PAGE_TABLE.bits
            | Self::PAGE_CACHE.bits;
    }
}

/// The state of a block that is owned by the buddy system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuddyState {
    /// On the free list of the pool for its order.
    Free,
    /// In transit: owned by an in-flight split, merge or allocation and on no list.
    Merging,
    /// On the per-CPU cache of a hart.
    Cached,
}

/// The role of a page, together with the data that belongs to that role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// Not managed by the buddy system.
    Reserved,
    /// First page of a block owned by the buddy system.
    BuddyHead { order: u8, state: BuddyState },
    /// Any other page of a block owned by the buddy system.
    BuddyTail { head: usize },
    /// Part of an anonymous allocation.
    Anon { order: u8 },
    /// Part of a page table allocation.
    PageTable { order: u8 },
    /// Part of a page cache allocation.
    PageCache { order: u8 },
    /// Backing memory of the slab descriptor at address `slab`.
    ///
    /// `slab` is zero until the slab layer binds the block.
    Slab { order: u8, slab: usize },
}

impl PageKind {
    /// Returns the kind that an allocation with the given flags stamps on its pages.
    pub fn for_alloc(flags: PageFlags, order: usize) -> Result<Self> {
        if flags.contains(PageFlags::LOCKED) {
            return Err(Error::InvalidFlags);
        }

        let order = order as u8;
        let ty = flags & PageFlags::TYPE_MASK;
        let kind = if ty.is_empty() || ty == PageFlags::ANON {
            PageKind::Anon { order }
        } else if ty == PageFlags::SLAB {
            PageKind::Slab { order, slab: 0 }
        } else if ty == PageFlags::PAGE_TABLE {
            PageKind::PageTable { order }
        } else if ty == PageFlags::PAGE_CACHE {
            PageKind::PageCache { order }
        } else {
            return Err(Error::InvalidFlags);
        };
        Ok(kind)
    }

    /// Returns the order of the allocation this page belongs to,
    /// or `None` if the page is not allocated.
    pub fn allocated_order(&self) -> Option<usize> {
        match *self {
            PageKind::Anon { order }
            | PageKind::PageTable { order }
            | PageKind::PageCache { order }
            | PageKind::Slab { order, .. } => Some(order as usize),
            PageKind::Reserved | PageKind::BuddyHead { .. } | PageKind::BuddyTail { .. } => None,
        }
    }

    /// Returns the type flag of an allocated page.
    pub fn flags(&self) -> PageFlags {
        match self {
            PageKind::Anon { .. } => PageFlags::ANON,
            PageKind::PageTable { .. } => PageFlags::PAGE_TABLE,
            PageKind::PageCache { .. } => PageFlags::PAGE_CACHE,
            PageKind::Slab { .. } => PageFlags::SLAB,
            _ => PageFlags::empty(),
        }
    }
}

/// The part of a [`Page`] that is protected by the page lock.
#[derive(Debug, Clone, Copy)]
pub struct PageMeta {
    pub kind: PageKind,
    /// The page can't be freed while this is set.
    pub locked: bool,
}

/// Descriptor of a single physical page.
pub struct Page {
    phys: usize,
    refcount: AtomicI32,
    link: Link,
    meta: SpinLock<PageMeta>,
}

impl Page {
    /// Create the descriptor for the page at `phys`.
    pub const fn new(phys: usize) -> Self {
        Self {
            phys,
            refcount: AtomicI32::new(0),
            link: Link::new(),
            meta: spin_lock(PageMeta {
                kind: PageKind::Reserved,
                locked: false,
            }),
        }
    }

    /// Returns the physical address of this page.
    pub fn phys(&self) -> usize {
        self.phys
    }

    /// Acquire the page lock.
    pub fn lock(&self) -> SpinLockGuard<'_, PageMeta> {
        self.meta.lock()
    }

    /// Returns a snapshot of the page kind.
    pub fn kind(&self) -> PageKind {
        self.lock().kind
    }

    /// Returns the current reference count.
    pub fn ref_count(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Takes another reference to this page and returns the new count.
    ///
    /// Fails if nobody holds a reference, because then the page is free.
    pub fn ref_inc(&self) -> Result<i32> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count > 0 {
                    Some(count + 1)
                } else {
                    None
                }
            })
            .map(|old| old + 1)
            .map_err(|_| Error::NotReferenced)
    }

    /// Drops a reference to this page and returns the new count.
    ///
    /// The count never goes below zero. Dropping a reference of an
    /// unreferenced page fails and leaves the count untouched.
    pub fn ref_dec(&self) -> Result<i32> {
        self.refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count > 0 {
                    Some(count - 1)
                } else {
                    None
                }
            })
            .map(|old| old - 1)
            .map_err(|_| Error::NotReferenced)
    }

    pub(super) fn set_ref_count(&self, count: i32) {
        self.refcount.store(count, Ordering::Release);
    }
}

/// The table of all page descriptors of a contiguous physical range.
#[derive(Clone, Copy)]
pub struct PageTable {
    base: usize,
    pages: &'static [Page],
}

impl PageTable {
    /// Create a table over already initialized descriptors.
    ///
    /// Page `i` must describe the physical page `base + i * PAGE_SIZE`.
    pub fn new(base: usize, pages: &'static [Page]) -> Self {
        assert_eq!(base % PAGE_SIZE, 0, "page table base {:#x} is unaligned", base);
        debug_assert!(pages
            .iter()
            .enumerate()
            .all(|(idx, page)| page.phys == base + (idx << PAGE_SHIFT)));
        Self { base, pages }
    }

    /// Initializes the descriptors inside `storage` for the pages starting at `base`.
    pub fn init(storage: &'static mut [MaybeUninit<Page>], base: usize) -> Self {
        for (idx, slot) in storage.iter_mut().enumerate() {
            slot.write(Page::new(base + (idx << PAGE_SHIFT)));
        }

        // SAFETY
        // Every element was initialized above.
        let pages = unsafe { &*(storage as *mut [MaybeUninit<Page>] as *const [Page]) };
        Self::new(base, pages)
    }

    /// The physical address of the first page.
    pub fn base(&self) -> usize {
        self.base
    }

    /// The physical address right after the last page.
    pub fn end(&self) -> usize {
        self.base + (self.pages.len() << PAGE_SHIFT)
    }

    /// The number of pages in this table.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns whether the table has no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns all descriptors.
    pub fn pages(&self) -> &'static [Page] {
        self.pages
    }

    /// Returns the descriptor at index `idx`.
    pub fn page(&self, idx: usize) -> &'static Page {
        &self.pages[idx]
    }

    /// Returns the index of the page containing `pa`.
    pub fn index_of(&self, pa: usize) -> Option<usize> {
        if pa < self.base || pa >= self.end() {
            return None;
        }
        Some((pa - self.base) >> PAGE_SHIFT)
    }

    /// Returns the index of `page`, which must belong to this table.
    pub fn index_of_page(&self, page: &Page) -> usize {
        self.index_of(page.phys)
            .unwrap_or_else(|| panic!("page {:#x} is not part of this table", page.phys))
    }

    /// Returns the descriptor of the page containing `pa`.
    pub fn pa_to_page(&self, pa: usize) -> Option<&'static Page> {
        self.index_of(pa).map(|idx| &self.pages[idx])
    }

    /// Locks two different pages, always the one at the lower address first.
    ///
    /// The guards are returned in argument order.
    pub fn lock_two(
        &self,
        a: usize,
        b: usize,
    ) -> (SpinLockGuard<'static, PageMeta>, SpinLockGuard<'static, PageMeta>) {
        assert_ne!(a, b, "tried to lock page {} twice", a);
        let (pa, pb) = (self.page(a), self.page(b));
        if a < b {
            let ga = pa.lock();
            (ga, pb.lock())
        } else {
            let gb = pb.lock();
            (pa.lock(), gb)
        }
    }

    /// Stamps `kind` on every page of the block at `head`.
    pub fn stamp(&self, head: usize, order: usize, kind: PageKind) {
        for page in &self.pages[head..head + (1 << order)] {
            page.lock().kind = kind;
        }
    }

    /// Returns the address of the slab whose backing memory contains `pa`.
    pub fn slab_of(&self, pa: usize) -> Option<usize> {
        match self.pa_to_page(pa)?.kind() {
            PageKind::Slab { slab, .. } if slab != 0 => Some(slab),
            _ => None,
        }
    }
}

impl Nodes for PageTable {
    fn link(&self, node: usize) -> &Link {
        &self.pages[node].link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn alloc_flags_select_kind() {
        assert_eq!(
            PageKind::for_alloc(PageFlags::empty(), 2),
            Ok(PageKind::Anon { order: 2 })
        );
        assert_eq!(
            PageKind::for_alloc(PageFlags::SLAB, 0),
            Ok(PageKind::Slab { order: 0, slab: 0 })
        );
        assert_eq!(
            PageKind::for_alloc(PageFlags::ANON | PageFlags::LOCKED, 0),
            Err(Error::InvalidFlags)
        );
        assert_eq!(
            PageKind::for_alloc(PageFlags::PAGE_TABLE | PageFlags::PAGE_CACHE, 0),
            Err(Error::InvalidFlags)
        );
    }

    #[test]
    fn ref_dec_at_zero_fails() {
        let page = Page::new(0x8000_0000);
        assert_eq!(page.ref_dec(), Err(Error::NotReferenced));
        assert_eq!(page.ref_count(), 0);
        assert_eq!(page.ref_inc(), Err(Error::NotReferenced));

        page.set_ref_count(1);
        assert_eq!(page.ref_inc(), Ok(2));
        assert_eq!(page.ref_dec(), Ok(1));
        assert_eq!(page.ref_dec(), Ok(0));
        assert_eq!(page.ref_dec(), Err(Error::NotReferenced));
        assert_eq!(page.ref_count(), 0);
    }

    #[test]
    fn table_lookups() {
        let base = 0x8000_0000;
        let table = testing::table(base, 4);

        assert_eq!(table.end(), base + 4 * PAGE_SIZE);
        assert_eq!(table.index_of(base + PAGE_SIZE + 12), Some(1));
        assert_eq!(table.index_of(base - 1), None);
        assert!(table.pa_to_page(table.end()).is_none());
        assert_eq!(table.pa_to_page(base + 3 * PAGE_SIZE).map(Page::phys), Some(base + 3 * PAGE_SIZE));

        let guards = table.lock_two(3, 1);
        assert!(table.page(1).meta.is_locked());
        assert!(table.page(3).meta.is_locked());
        drop(guards);
        assert!(!table.page(1).meta.is_locked());
    }
}
