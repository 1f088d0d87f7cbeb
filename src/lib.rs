//! The physical memory core of the Windy kernel.
//!
//! Pages come from a buddy system with per-CPU caches, small objects from
//! slab caches carved out of buddy blocks, and everything the two need
//! before they exist from the early allocator.

#![deny(rust_2018_idioms)]
#![cfg_attr(not(test), no_std)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("kmem can only run on 64 bit systems");

#[cfg(not(target_has_atomic = "ptr"))]
compile_error!("kmem can only run on systems that have atomic support");

pub mod arch;
pub mod kmem;
pub mod mem;
pub mod print;
pub mod sync;
pub mod unit;

#[cfg(test)]
mod testing;

pub use kmem::{
    __page_alloc, __page_free, init, kalloc, kfree, kmem, kmm_alloc, kmm_free, kmm_shrink_all,
    page_alloc, page_buddy_stat, page_free, page_ref_count, page_ref_dec, page_ref_inc,
    print_buddy_system_stat, set_page_locked, slab_alloc, slab_cache_create, slab_cache_destroy,
    slab_cache_init, slab_cache_shrink, slab_cache_stat, slab_dump_all, slab_free,
    slab_free_noshrink, slab_shrink_all, Kmem,
};
pub use mem::{Config, Error, Result};
