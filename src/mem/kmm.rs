//! General purpose allocation of small objects.
//!
//! A request is served by the smallest cache of a fixed ladder whose objects
//! are large enough. Larger requests have to go to the buddy system.

use super::{
    slab::{CacheFlags, SlabAllocator, SlabCache},
    Error, Result,
};
use core::ptr::NonNull;

/// The number of caches in the ladder.
pub const KMM_CACHES: usize = 8;

/// The object sizes of the ladder.
pub const KMM_SIZES: [usize; KMM_CACHES] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// The ladder of size classes.
pub struct Kmm {
    slabs: &'static SlabAllocator,
    caches: [SlabCache; KMM_CACHES],
}

impl Kmm {
    /// Create the ladder on top of `slabs`.
    ///
    /// [`init`](Self::init) registers the caches once the ladder has its final address.
    pub fn new(slabs: &'static SlabAllocator) -> Result<Self> {
        let cache = |name, size| {
            SlabCache::new(
                name,
                size,
                CacheFlags::STATIC | CacheFlags::EMBEDDED,
                slabs.buddy(),
                None,
                false,
            )
        };

        Ok(Self {
            slabs,
            caches: [
                cache("kmm-32", KMM_SIZES[0])?,
                cache("kmm-64", KMM_SIZES[1])?,
                cache("kmm-128", KMM_SIZES[2])?,
                cache("kmm-256", KMM_SIZES[3])?,
                cache("kmm-512", KMM_SIZES[4])?,
                cache("kmm-1024", KMM_SIZES[5])?,
                cache("kmm-2048", KMM_SIZES[6])?,
                cache("kmm-4096", KMM_SIZES[7])?,
            ],
        })
    }

    /// Registers every cache of the ladder.
    pub fn init(&'static self) {
        self.caches.iter().for_each(|cache| self.slabs.register(cache));
    }

    /// Returns the cache that serves requests of `size` bytes.
    pub fn cache_for(&self, size: usize) -> Result<&SlabCache> {
        self.caches
            .iter()
            .find(|cache| cache.obj_size() >= size)
            .ok_or(Error::ObjectTooLarge)
    }

    /// Allocates at least `size` bytes.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.cache_for(size)?.alloc()
    }

    /// Frees memory returned by [`alloc`](Self::alloc).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) and must not be used anymore.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<()> {
        self.slabs.free(ptr)
    }

    /// Returns about half of the free slabs of every cache to the buddy system.
    pub fn shrink_all(&self) -> usize {
        self.slabs.shrink_all()
    }

    /// The caches of the ladder, smallest first.
    pub fn caches(&self) -> &[SlabCache] {
        &self.caches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem::Config, testing};

    #[test]
    fn requests_pick_the_smallest_fitting_cache() {
        let kmem = testing::kmem(256, Config::default());
        let kmm = kmem.kmm();

        assert_eq!(kmm.cache_for(0).map(SlabCache::name), Ok("kmm-32"));
        assert_eq!(kmm.cache_for(33).map(SlabCache::name), Ok("kmm-64"));
        assert_eq!(kmm.cache_for(4096).map(SlabCache::name), Ok("kmm-4096"));
        assert_eq!(kmm.cache_for(4097).err(), Some(Error::ObjectTooLarge));
        assert_eq!(kmm.alloc(5000).err(), Some(Error::ObjectTooLarge));
    }

    #[test]
    fn objects_come_back_to_their_cache() {
        let kmem = testing::kmem(256, Config::default());
        let kmm = kmem.kmm();

        let small = kmm.alloc(24).unwrap();
        let large = kmm.alloc(3000).unwrap();
        assert_eq!(small.as_ptr() as usize % 8, 0);
        assert_eq!(kmm.caches()[0].stat().obj_active, 1);
        assert_eq!(kmm.caches()[7].stat().obj_active, 1);

        unsafe {
            kmm.free(small).unwrap();
            kmm.free(large).unwrap();
        }
        assert!(kmm.caches().iter().all(|cache| cache.stat().obj_active == 0));

        assert_eq!(kmm.shrink_all(), 2);
        assert!(kmm.caches().iter().all(|cache| cache.stat().slab_total == 0));
    }

    #[test]
    fn ladder_is_registered() {
        let kmem = testing::kmem(256, Config::default());
        let mut names = std::vec::Vec::new();
        kmem.slabs().for_each(|cache| names.push(cache.name()));

        assert_eq!(names.len(), 2 + KMM_CACHES);
        assert!(names.contains(&"kmm-32"));
        assert!(names.contains(&"slab-desc"));
    }
}
