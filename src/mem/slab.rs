//! The slab allocator.
//!
//! Objects of a fixed size are carved out of buddy blocks called slabs. Every
//! page of a slab points to the slab descriptor, so an object can be freed by
//! its address alone. The descriptor is either embedded at the start of the
//! slab memory or allocated from an internal cache of descriptors.
//!
//! All caches are linked into a registry, which is what [`SlabAllocator::shrink_all`]
//! and [`SlabAllocator::dump_all`] walk.

mod cache;
mod descriptor;

pub use cache::{CacheStat, SlabCache};
pub use descriptor::{Slab, NO_OWNER};

use super::{
    buddy::BuddySystem,
    list::{Link, List, Nodes},
    Error, Result, PAGE_SIZE,
};
use crate::sync::{spin_lock, SpinLock};
use bitflags::bitflags;
use core::{
    mem::{self, MaybeUninit},
    ptr::NonNull,
};
use log::{debug, info};

/// The smallest object size, and the alignment of every object.
pub const SLAB_OBJ_MIN_SIZE: usize = 8;

/// The largest object size a cache can hold.
pub const SLAB_OBJ_MAX_SIZE: usize = PAGE_SIZE;

/// A slab holds at least this many objects, unless it would exceed [`SLAB_MAX_ORDER`].
pub const SLAB_MIN_OBJECTS: usize = 8;

/// The largest buddy order used for a slab.
pub const SLAB_MAX_ORDER: usize = 5;

/// No slab holds more objects than a single page of the smallest objects.
pub const SLAB_MAX_OBJECTS: usize = PAGE_SIZE / SLAB_OBJ_MIN_SIZE;

bitflags! {
    /// Properties of a slab cache.
    pub struct CacheFlags: u32 {
        /// The cache can never be destroyed.
        const STATIC = 1 << 0;
        /// Slab descriptors live at the start of the slab memory.
        const EMBEDDED = 1 << 1;
    }
}

/// The geometry of the slabs of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabLayout {
    /// The object size, a multiple of [`SLAB_OBJ_MIN_SIZE`].
    pub obj_size: usize,
    /// Offset of the first object from the start of the slab.
    pub offset: usize,
    /// The buddy order of every slab.
    pub order: usize,
    /// The number of objects per slab.
    pub capacity: usize,
}

impl SlabLayout {
    /// Computes the layout for objects of `obj_size` bytes.
    pub fn new(obj_size: usize, flags: CacheFlags) -> Result<Self> {
        if obj_size > SLAB_OBJ_MAX_SIZE {
            return Err(Error::ObjectTooLarge);
        }
        let obj_size = super::align_up(obj_size.max(SLAB_OBJ_MIN_SIZE), SLAB_OBJ_MIN_SIZE);

        let offset = if flags.contains(CacheFlags::EMBEDDED) {
            let header = mem::size_of::<Slab>();
            (header + obj_size - 1) / obj_size * obj_size
        } else {
            0
        };

        let mut order = match obj_size {
            0..=128 => 0,
            129..=512 => 1,
            513..=1024 => 2,
            1025..=2048 => 3,
            _ => 4,
        };
        let capacity = |order: usize| ((PAGE_SIZE << order) - offset) / obj_size;
        while capacity(order) < SLAB_MIN_OBJECTS && order < SLAB_MAX_ORDER {
            order += 1;
        }

        Ok(Self {
            obj_size,
            offset,
            order,
            capacity: capacity(order),
        })
    }
}

/// Resolves cache handles, which are cache addresses.
struct CacheNodes;

impl Nodes for CacheNodes {
    fn link(&self, node: usize) -> &Link {
        // SAFETY
        // Only registered, and therefore live, caches are on the registry.
        unsafe { &(*(node as *const SlabCache)).link }
    }
}

/// The registry of all caches, together with the internal caches.
pub struct SlabAllocator {
    buddy: &'static BuddySystem,
    registry: SpinLock<List>,
    /// Descriptors of slabs that don't embed them.
    descs: SlabCache,
    /// Caches created at runtime.
    caches: SlabCache,
}

impl SlabAllocator {
    /// Create the slab allocator on top of `buddy`.
    ///
    /// [`init`](Self::init) must be called once the allocator has its final address.
    pub fn new(buddy: &'static BuddySystem) -> Result<Self> {
        let flags = CacheFlags::STATIC | CacheFlags::EMBEDDED;
        Ok(Self {
            buddy,
            registry: spin_lock(List::new()),
            descs: SlabCache::new("slab-desc", mem::size_of::<Slab>(), flags, buddy, None, false)?,
            caches: SlabCache::new(
                "slab-cache",
                mem::size_of::<SlabCache>(),
                flags,
                buddy,
                None,
                false,
            )?,
        })
    }

    /// Registers the internal caches.
    pub fn init(&'static self) {
        self.register(&self.descs);
        self.register(&self.caches);
    }

    pub fn buddy(&self) -> &'static BuddySystem {
        self.buddy
    }

    /// Initializes a cache inside caller provided storage and registers it.
    pub fn cache_init(
        &'static self,
        storage: &'static mut MaybeUninit<SlabCache>,
        name: &'static str,
        obj_size: usize,
        flags: CacheFlags,
    ) -> Result<&'static SlabCache> {
        let cache = SlabCache::new(name, obj_size, flags, self.buddy, self.descs_for(flags), false)?;
        let cache: &'static SlabCache = storage.write(cache);
        self.register(cache);
        debug!("Initialized cache {} with {:?}", name, cache.layout());
        Ok(cache)
    }

    /// Creates a cache whose descriptor is allocated from the cache of caches.
    pub fn cache_create(
        &'static self,
        name: &'static str,
        obj_size: usize,
        flags: CacheFlags,
    ) -> Result<&'static SlabCache> {
        let cache = SlabCache::new(name, obj_size, flags, self.buddy, self.descs_for(flags), true)?;
        let storage = self.caches.alloc()?.cast::<SlabCache>();

        // SAFETY
        // The object is fresh, properly sized and aligned, and never freed
        // while the cache is registered.
        let cache: &'static SlabCache = unsafe {
            storage.as_ptr().write(cache);
            &*storage.as_ptr()
        };
        self.register(cache);
        debug!("Created cache {} with {:?}", name, cache.layout());
        Ok(cache)
    }

    /// Releases every free slab of `cache` and unregisters it.
    ///
    /// Static caches and caches that still have objects in use are refused.
    ///
    /// # Safety
    ///
    /// `cache` must not be used after it was destroyed.
    pub unsafe fn cache_destroy(&self, cache: &'static SlabCache) -> Result<()> {
        if cache.flags().contains(CacheFlags::STATIC) {
            return Err(Error::StaticCache);
        }
        if cache.is_busy() {
            return Err(Error::CacheBusy);
        }

        cache.shrink(0);
        self.registry.lock().remove(&CacheNodes, cache_node(cache));
        debug!("Destroyed cache {}", cache.name());

        if cache.is_dynamic() {
            self.free_noshrink(NonNull::from(cache).cast())?;
        }
        Ok(())
    }

    /// Frees an object of any cache.
    ///
    /// Fails with [`Error::NotSlabObject`] if `obj` isn't inside slab memory.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated from a slab cache and must not be used anymore.
    pub unsafe fn free(&self, obj: NonNull<u8>) -> Result<()> {
        cache::free_object(self.buddy.table(), obj.as_ptr() as usize, true)
    }

    /// Like [`free`](Self::free), but never releases slabs.
    ///
    /// # Safety
    ///
    /// See [`free`](Self::free).
    pub unsafe fn free_noshrink(&self, obj: NonNull<u8>) -> Result<()> {
        cache::free_object(self.buddy.table(), obj.as_ptr() as usize, false)
    }

    /// Releases about half of the free slabs of every registered cache.
    ///
    /// Returns the number of released slabs.
    pub fn shrink_all(&self) -> usize {
        let mut released = 0;
        self.for_each(|cache| {
            let free = cache.free_slabs();
            if free > 0 {
                released += cache.shrink((free + 1) / 2);
            }
        });

        debug!("Released {} slabs over all caches", released);
        released
    }

    /// Logs the statistics of every registered cache.
    pub fn dump_all(&self) {
        info!("Slab caches");
        self.for_each(|cache| info!("{}", cache.stat()));
    }

    /// Runs `f` on every registered cache.
    ///
    /// The registry is locked while `f` runs, so `f` must not create or destroy caches.
    pub fn for_each(&self, mut f: impl FnMut(&SlabCache)) {
        let registry = self.registry.lock();
        for node in registry.iter(&CacheNodes) {
            // SAFETY
            // Only live caches are registered.
            f(unsafe { &*(node as *const SlabCache) });
        }
    }

    pub(super) fn register(&self, cache: &'static SlabCache) {
        self.registry.lock().push_back(&CacheNodes, cache_node(cache));
    }

    fn descs_for(&'static self, flags: CacheFlags) -> Option<&'static SlabCache> {
        if flags.contains(CacheFlags::EMBEDDED) {
            None
        } else {
            Some(&self.descs)
        }
    }
}

fn cache_node(cache: &SlabCache) -> usize {
    cache as *const SlabCache as usize
}
