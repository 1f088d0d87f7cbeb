//! The slab descriptor.

use super::{cache::SlabCache, SLAB_MAX_OBJECTS};
use crate::{
    mem::{
        list::{Link, Nodes},
        page::Page,
    },
    sync::{spin_lock, SpinLock, SpinLockGuard},
};
use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicIsize, AtomicPtr, Ordering},
};

/// Owner of a slab that no hart owns.
pub const NO_OWNER: isize = -1;

/// One buddy block carved into objects of a single cache.
///
/// Whether a slab is free, partial or full is never stored. It follows from
/// the number of objects in use compared to the capacity of its cache.
pub struct Slab {
    /// Null once the slab was detached from its cache.
    cache: AtomicPtr<SlabCache>,
    page: &'static Page,
    order: usize,
    /// Hart whose partial or full list holds this slab.
    owner: AtomicIsize,
    pub(super) link: Link,
    objects: SpinLock<Objects>,
}

const BITMAP_WORDS: usize = SLAB_MAX_OBJECTS / 64;

/// The free objects of a slab, threaded through the objects themselves.
///
/// A bitmap with one bit per object tracks which objects are handed out,
/// so a second free of the same object is caught before it corrupts the list.
pub(super) struct Objects {
    free: usize,
    in_use: usize,
    first: usize,
    size: usize,
    used: [u64; BITMAP_WORDS],
}

impl Objects {
    pub(super) fn in_use(&self) -> usize {
        self.in_use
    }

    /// Flips the bit of `obj` to `used` and returns the old value.
    fn mark(&mut self, obj: usize, used: bool) -> bool {
        let idx = (obj - self.first) / self.size;
        let (word, bit) = (idx / 64, 1u64 << (idx % 64));
        let old = self.used[word] & bit != 0;
        if used {
            self.used[word] |= bit;
        } else {
            self.used[word] &= !bit;
        }
        old
    }

    /// Takes the first free object.
    ///
    /// # Safety
    ///
    /// The free list must only contain objects of this slab.
    pub(super) unsafe fn pop(&mut self) -> Option<NonNull<u8>> {
        let obj = NonNull::new(self.free as *mut u8)?;
        assert!(
            !self.mark(self.free, true),
            "slab: object {:#x} is already in use, double allocation",
            self.free
        );
        self.free = ptr::read(obj.as_ptr() as *const usize);
        self.in_use += 1;
        Some(obj)
    }

    /// Puts `obj` back onto the free list.
    ///
    /// # Safety
    ///
    /// `obj` must be an object of this slab.
    pub(super) unsafe fn push(&mut self, obj: usize) {
        assert!(
            self.mark(obj, false),
            "slab: object {:#x} is not in use, double free",
            obj
        );
        self.in_use = self
            .in_use
            .checked_sub(1)
            .unwrap_or_else(|| panic!("slab: freeing {:#x} into a slab without objects in use", obj));
        ptr::write(obj as *mut usize, self.free);
        self.free = obj;
    }
}

impl Slab {
    /// Creates the descriptor and links `count` objects of `size` bytes,
    /// starting at `first`, into the free list.
    ///
    /// # Safety
    ///
    /// The objects must be inside memory that belongs to the new slab.
    pub(super) unsafe fn new(
        cache: &SlabCache,
        page: &'static Page,
        order: usize,
        first: usize,
        size: usize,
        count: usize,
    ) -> Self {
        assert!(count <= SLAB_MAX_OBJECTS, "slab: {} objects don't fit the bitmap", count);
        for idx in 0..count {
            let obj = first + idx * size;
            let next = if idx + 1 < count { obj + size } else { 0 };
            ptr::write(obj as *mut usize, next);
        }

        Self {
            cache: AtomicPtr::new(cache as *const SlabCache as *mut SlabCache),
            page,
            order,
            owner: AtomicIsize::new(NO_OWNER),
            link: Link::new(),
            objects: spin_lock(Objects {
                free: if count > 0 { first } else { 0 },
                in_use: 0,
                first,
                size,
                used: [0; BITMAP_WORDS],
            }),
        }
    }

    /// The cache this slab is attached to, null if detached.
    pub fn cache_ptr(&self) -> *const SlabCache {
        self.cache.load(Ordering::Acquire)
    }

    /// The first page of the backing block.
    pub fn page(&self) -> &'static Page {
        self.page
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// The hart owning this slab, or [`NO_OWNER`].
    pub fn owner(&self) -> isize {
        self.owner.load(Ordering::Acquire)
    }

    pub(super) fn set_owner(&self, owner: isize) {
        self.owner.store(owner, Ordering::Release);
    }

    /// The number of objects handed out.
    pub fn in_use(&self) -> usize {
        self.objects.lock().in_use
    }

    pub(super) fn objects(&self) -> SpinLockGuard<'_, Objects> {
        self.objects.lock()
    }

    /// Detaches the slab from its cache and returns the old cache.
    pub(super) fn detach(&self) -> *const SlabCache {
        self.cache.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

/// Resolves slab handles, which are descriptor addresses.
pub(super) struct SlabNodes;

impl Nodes for SlabNodes {
    fn link(&self, node: usize) -> &Link {
        // SAFETY
        // Only addresses of live slab descriptors are put on slab lists.
        unsafe { &slab_ref(node).link }
    }
}

/// Returns the slab descriptor at `addr`.
///
/// # Safety
///
/// `addr` must be the address of a live slab descriptor.
pub(super) unsafe fn slab_ref<'a>(addr: usize) -> &'a Slab {
    &*(addr as *const Slab)
}
