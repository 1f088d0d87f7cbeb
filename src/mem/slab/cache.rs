//! A cache of equally sized objects.
//!
//! Every hart owns a partial and a full list of slabs. A hart allocates from
//! its own partial list first, then from the global list of free slabs and
//! creates a new slab only if both are empty. Objects may be freed from any
//! hart: the free goes through the lists of the hart owning the slab. A slab
//! whose last object was freed leaves its owner and moves to the global free
//! list, where it waits to be reused or released by a shrink.

use super::{
    descriptor::{slab_ref, Slab, SlabNodes, NO_OWNER},
    CacheFlags, SlabLayout,
};
use crate::{
    mem::{
        buddy::BuddySystem,
        list::{Link, List},
        page::{PageFlags, PageKind, PageTable},
        Error, Result, NCPU,
    },
    sync::{spin_lock, IrqGuard, SpinLock},
};
use core::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};
use log::{debug, trace, warn};

/// The slabs owned by one hart.
struct CpuSlabs {
    partial: List,
    full: List,
}

/// A cache of objects with a fixed size.
pub struct SlabCache {
    name: &'static str,
    flags: CacheFlags,
    layout: SlabLayout,
    limits: usize,
    buddy: &'static BuddySystem,
    /// Where descriptors of non-embedded slabs come from.
    descs: Option<&'static SlabCache>,
    /// Set if the cache itself was allocated from the cache of caches.
    dynamic: bool,
    cpus: [SpinLock<CpuSlabs>; NCPU],
    free: SpinLock<List>,
    pub(super) link: Link,
    slab_total: AtomicUsize,
    slab_free: AtomicUsize,
    obj_total: AtomicUsize,
    obj_active: AtomicUsize,
}

impl SlabCache {
    pub(crate) fn new(
        name: &'static str,
        obj_size: usize,
        flags: CacheFlags,
        buddy: &'static BuddySystem,
        descs: Option<&'static SlabCache>,
        dynamic: bool,
    ) -> Result<Self> {
        assert!(
            flags.contains(CacheFlags::EMBEDDED) || descs.is_some(),
            "cache {}: slab descriptors need a home",
            name
        );

        let layout = SlabLayout::new(obj_size, flags)?;
        Ok(Self {
            name,
            flags,
            layout,
            limits: layout.capacity * buddy.config().slab_shrink_multiple,
            buddy,
            descs,
            dynamic,
            cpus: core::array::from_fn(|_| {
                spin_lock(CpuSlabs {
                    partial: List::new(),
                    full: List::new(),
                })
            }),
            free: spin_lock(List::new()),
            link: Link::new(),
            slab_total: AtomicUsize::new(0),
            slab_free: AtomicUsize::new(0),
            obj_total: AtomicUsize::new(0),
            obj_active: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// The size of every object, rounded up to the object alignment.
    pub fn obj_size(&self) -> usize {
        self.layout.obj_size
    }

    /// The geometry of the slabs of this cache.
    pub fn layout(&self) -> SlabLayout {
        self.layout
    }

    /// The number of free objects above which frees start releasing slabs.
    pub fn limits(&self) -> usize {
        self.limits
    }

    pub(super) fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Allocates one object.
    ///
    /// The returned pointer is aligned to at least 8 bytes. Its content is
    /// undefined.
    pub fn alloc(&self) -> Result<NonNull<u8>> {
        let _irq = IrqGuard::new(self.buddy.harts());
        let cpu = self.buddy.cpu_id();

        let obj = match self.alloc_partial(cpu) {
            Some(obj) => obj,
            None => self.alloc_fresh(cpu)?,
        };
        self.obj_active.fetch_add(1, Ordering::Relaxed);

        trace!("Cache {} handed out {:p} on hart {}", self.name, obj, cpu);
        Ok(obj)
    }

    /// Takes an object out of a slab on the partial list of `cpu`.
    fn alloc_partial(&self, cpu: usize) -> Option<NonNull<u8>> {
        let mut local = self.cpus[cpu].lock();
        let node = local.partial.front()?;

        // SAFETY
        // Slabs on our lists are alive and their free lists only hold their own objects.
        let slab = unsafe { slab_ref(node) };
        let mut objects = slab.objects();
        let obj = unsafe { objects.pop() }.unwrap_or_else(|| {
            panic!(
                "cache {}: slab {:#x} on the partial list has no free object",
                self.name, node
            )
        });

        if objects.in_use() == self.layout.capacity {
            drop(objects);
            local.partial.remove(&SlabNodes, node);
            local.full.push_back(&SlabNodes, node);
        }

        #[cfg(feature = "sanitizer")]
        self.check_object(slab, obj.as_ptr() as usize);

        Some(obj)
    }

    /// Takes an object out of a free slab, creating one if there is none,
    /// and hands the slab to `cpu`.
    fn alloc_fresh(&self, cpu: usize) -> Result<NonNull<u8>> {
        let reused = {
            let mut free = self.free.lock();
            let node = free.pop_front(&SlabNodes);
            if node.is_some() {
                counter_sub(&self.slab_free, 1);
            }
            node
        };
        let node = match reused {
            Some(node) => node,
            None => self.make_slab()?,
        };

        // SAFETY
        // The slab is on no list, so nobody else can reach it.
        let slab = unsafe { slab_ref(node) };
        slab.set_owner(cpu as isize);

        let mut local = self.cpus[cpu].lock();
        let mut objects = slab.objects();
        let obj = unsafe { objects.pop() }.unwrap_or_else(|| {
            panic!("cache {}: free slab {:#x} has no free object", self.name, node)
        });
        let full = objects.in_use() == self.layout.capacity;
        drop(objects);

        if full {
            local.full.push_back(&SlabNodes, node);
        } else {
            local.partial.push_back(&SlabNodes, node);
        }
        Ok(obj)
    }

    /// Returns `obj` to `slab`, which must belong to this cache.
    ///
    /// If `shrink` is set and too many objects are free, half of the free
    /// slabs are released. A slab emptied by this free is queued afterwards,
    /// so it survives the shrink.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated from this cache and must not be used anymore.
    pub(super) unsafe fn free_in(&self, slab: &Slab, obj: usize, shrink: bool) {
        self.check_object(slab, obj);

        let _irq = IrqGuard::new(self.buddy.harts());
        let node = slab as *const Slab as usize;

        // the owner may change until its list is locked
        let empty = loop {
            let owner = slab.owner();
            if owner == NO_OWNER {
                panic!(
                    "slab_free: object {:#x} of cache {} is in a free slab, double free?",
                    obj, self.name
                );
            }

            let mut local = self.cpus[owner as usize].lock();
            if slab.owner() != owner {
                continue;
            }

            let (was_full, empty) = {
                let mut objects = slab.objects();
                let was_full = objects.in_use() == self.layout.capacity;
                objects.push(obj);
                (was_full, objects.in_use() == 0)
            };
            counter_sub(&self.obj_active, 1);

            if empty {
                if was_full {
                    local.full.remove(&SlabNodes, node);
                } else {
                    local.partial.remove(&SlabNodes, node);
                }
                slab.set_owner(NO_OWNER);
            } else if was_full {
                local.full.remove(&SlabNodes, node);
                local.partial.push_back(&SlabNodes, node);
            }
            break empty;
        };

        // relieve pressure before the just-freed slab joins the free list
        if shrink && self.under_pressure() {
            let count = self.free_slabs() / 2;
            if count > 0 {
                self.shrink(count);
            }
        }

        if empty {
            let mut free = self.free.lock();
            free.push_back(&SlabNodes, node);
            self.slab_free.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Releases up to `count` free slabs back to the buddy system.
    ///
    /// A `count` of zero, or one larger than the number of free slabs,
    /// releases every free slab. Returns the number of released slabs.
    pub fn shrink(&self, count: usize) -> usize {
        let mut doomed = List::new();
        {
            let mut free = self.free.lock();
            let count = if count == 0 || count > free.len() {
                free.len()
            } else {
                count
            };

            for _ in 0..count {
                if let Some(node) = free.pop_back(&SlabNodes) {
                    doomed.push_back(&SlabNodes, node);
                    counter_sub(&self.slab_free, 1);
                }
            }
        }

        let released = doomed.len();
        while let Some(node) = doomed.pop_front(&SlabNodes) {
            // SAFETY
            // The slab was free, so it has no objects in use and it's on no list now.
            unsafe { self.destroy_slab(node) };
        }

        if released > 0 {
            debug!("Cache {} released {} slabs", self.name, released);
        }
        released
    }

    /// The number of slabs waiting on the global free list.
    pub fn free_slabs(&self) -> usize {
        self.slab_free.load(Ordering::Relaxed)
    }

    /// Returns whether any hart holds slabs with objects in use.
    pub fn is_busy(&self) -> bool {
        self.cpus.iter().any(|cpu| {
            let cpu = cpu.lock();
            !cpu.partial.is_empty() || !cpu.full.is_empty()
        })
    }

    /// Counts the objects in use by walking every slab that has some.
    pub fn objects_in_use(&self) -> usize {
        let mut in_use = 0;
        for cpu in &self.cpus {
            let cpu = cpu.lock();
            for node in cpu.partial.iter(&SlabNodes).chain(cpu.full.iter(&SlabNodes)) {
                // SAFETY
                // Slabs on our lists are alive.
                in_use += unsafe { slab_ref(node) }.in_use();
            }
        }
        in_use
    }

    /// Returns a snapshot of the cache population.
    pub fn stat(&self) -> CacheStat {
        let mut partial = 0;
        let mut full = 0;
        for cpu in &self.cpus {
            let cpu = cpu.lock();
            partial += cpu.partial.len();
            full += cpu.full.len();
        }

        CacheStat {
            name: self.name,
            obj_size: self.layout.obj_size,
            capacity: self.layout.capacity,
            order: self.layout.order,
            slab_total: self.slab_total.load(Ordering::Relaxed),
            slab_free: self.slab_free.load(Ordering::Relaxed),
            slab_partial: partial,
            slab_full: full,
            obj_total: self.obj_total.load(Ordering::Relaxed),
            obj_active: self.obj_active.load(Ordering::Relaxed),
        }
    }

    fn under_pressure(&self) -> bool {
        let total = self.obj_total.load(Ordering::Relaxed);
        let active = self.obj_active.load(Ordering::Relaxed);
        total.saturating_sub(active) > self.limits
    }

    /// Panics if `obj` is not the start of an object inside `slab`.
    fn check_object(&self, slab: &Slab, obj: usize) {
        assert!(
            ptr::eq(slab.cache_ptr(), self),
            "slab_free: object {:#x} doesn't belong to cache {}",
            obj,
            self.name
        );

        let first = slab.page().phys() + self.layout.offset;
        let valid = obj
            .checked_sub(first)
            .map(|rel| rel % self.layout.obj_size == 0 && rel / self.layout.obj_size < self.layout.capacity)
            .unwrap_or(false);
        assert!(
            valid,
            "slab_free: {:#x} is not an object of cache {}",
            obj, self.name
        );
    }

    /// Allocates the backing block of a new slab and lays out the slab inside it.
    ///
    /// Returns the address of the new descriptor, which is on no list.
    fn make_slab(&self) -> Result<usize> {
        let order = self.layout.order;
        let page = self.buddy.alloc(order, PageFlags::SLAB)?;
        let base = page.phys();

        let desc = match self.descs {
            _ if self.flags.contains(CacheFlags::EMBEDDED) => base,
            Some(descs) => match descs.alloc() {
                Ok(desc) => desc.as_ptr() as usize,
                Err(err) => {
                    self.buddy.free(page, order);
                    return Err(err);
                }
            },
            None => unreachable!("checked when the cache was created"),
        };

        // SAFETY
        // The block was just allocated for us, and `desc` is either the head
        // of that block or a fresh object large enough for a descriptor.
        unsafe {
            let slab = Slab::new(
                self,
                page,
                order,
                base + self.layout.offset,
                self.layout.obj_size,
                self.layout.capacity,
            );
            ptr::write(desc as *mut Slab, slab);
        }

        let table = self.buddy.table();
        table.stamp(
            table.index_of_page(page),
            order,
            PageKind::Slab {
                order: order as u8,
                slab: desc,
            },
        );

        self.slab_total.fetch_add(1, Ordering::Relaxed);
        self.obj_total
            .fetch_add(self.layout.capacity, Ordering::Relaxed);
        debug!(
            "Cache {} created slab {:#x} at {:#x} with {} objects",
            self.name, desc, base, self.layout.capacity
        );
        Ok(desc)
    }

    /// Gives the memory of an unused slab back to the buddy system.
    ///
    /// # Safety
    ///
    /// The slab must belong to this cache, must be on no list and must
    /// have no objects in use.
    unsafe fn destroy_slab(&self, node: usize) {
        let slab = slab_ref(node);
        assert!(!slab.link.is_linked(), "slab {:#x} destroyed while queued", node);
        assert_eq!(
            slab.in_use(),
            0,
            "cache {}: slab {:#x} destroyed with objects in use",
            self.name,
            node
        );

        let cache = slab.detach();
        assert!(
            ptr::eq(cache, self),
            "cache {}: slab {:#x} belongs to another cache",
            self.name,
            node
        );

        let (page, order) = (slab.page(), slab.order());
        counter_sub(&self.slab_total, 1);
        counter_sub(&self.obj_total, self.layout.capacity);

        if !self.flags.contains(CacheFlags::EMBEDDED) {
            if let Err(err) = free_object(self.buddy.table(), node, false) {
                panic!(
                    "cache {}: descriptor {:#x} can't be freed: {}",
                    self.name, node, err
                );
            }
        }
        self.buddy.free(page, order);
        trace!("Cache {} destroyed slab {:#x}", self.name, node);
    }
}

/// Frees `obj` into the cache that owns it.
///
/// The owning slab is found through the page descriptor of `obj`.
///
/// # Safety
///
/// If `obj` lies in slab memory it must be a live object that is not used anymore.
pub(super) unsafe fn free_object(table: &PageTable, obj: usize, shrink: bool) -> Result<()> {
    let node = match table.slab_of(obj) {
        Some(node) => node,
        None => {
            warn!("slab_free: {:#x} is not a slab object", obj);
            return Err(Error::NotSlabObject);
        }
    };

    let slab = slab_ref(node);
    let cache = slab.cache_ptr();
    assert!(
        !cache.is_null(),
        "slab_free: slab {:#x} of object {:#x} has no cache",
        node,
        obj
    );
    (*cache).free_in(slab, obj, shrink);
    Ok(())
}

fn counter_sub(counter: &AtomicUsize, n: usize) {
    let res = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
        count.checked_sub(n)
    });
    assert!(res.is_ok(), "slab counter underflow");
}

/// A snapshot of a cache population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStat {
    pub name: &'static str,
    pub obj_size: usize,
    /// Objects per slab.
    pub capacity: usize,
    pub order: usize,
    pub slab_total: usize,
    pub slab_free: usize,
    pub slab_partial: usize,
    pub slab_full: usize,
    pub obj_total: usize,
    pub obj_active: usize,
}

impl fmt::Display for CacheStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:>5} B x {:>3} (order {}): {} slabs ({} free, {} partial, {} full), {}/{} objects",
            self.name,
            self.obj_size,
            self.capacity,
            self.order,
            self.slab_total,
            self.slab_free,
            self.slab_partial,
            self.slab_full,
            self.obj_active,
            self.obj_total
        )
    }
}
