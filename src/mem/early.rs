//! The boot allocator.
//!
//! Used before the buddy system exists, to hand out the page descriptor table
//! and the allocator structures themselves. Memory is never given back.
//!
//! Small requests (up to [`LARGEST_CHUNK`]) are rounded up to a power of two
//! and aligned to that size. They are served from per-size free lists first,
//! splitting a larger free chunk if needed, and otherwise by advancing the
//! current pointer. Whenever aligning the current pointer skips memory, the
//! gap is cut into aligned chunks and put onto the free lists. Large requests
//! respect the caller's alignment and always advance the pointer.
//!
//! Running out of memory this early is fatal.

use super::align_up;
use core::{
    mem::{self, MaybeUninit},
    ptr::{self, NonNull},
    slice,
};

/// Written into the header of every free chunk.
const CHUNK_MAGIC: u64 = 0xEAAC_CCCC_EAAC_CCCC;

const SMALLEST_ORDER: usize = 5;
const LARGEST_ORDER: usize = 16;
const CHUNK_ORDERS: usize = LARGEST_ORDER - SMALLEST_ORDER + 1;

/// The smallest chunk, and the default alignment.
pub const SMALLEST_CHUNK: usize = 1 << SMALLEST_ORDER;
/// The largest chunk kept on a free list.
pub const LARGEST_CHUNK: usize = 1 << LARGEST_ORDER;

/// Header of a free chunk.
#[repr(C)]
struct Chunk {
    magic: u64,
    size: usize,
    next: usize,
}

/// Single threaded bump allocator with recycled alignment gaps.
pub struct EarlyAllocator {
    /// Address of the first free chunk of every order, `0` if there is none.
    free: [usize; CHUNK_ORDERS],
    current: usize,
    end: usize,
}

impl EarlyAllocator {
    /// Create an allocator handing out memory from `start..end`.
    ///
    /// # Safety
    ///
    /// The memory in `start..end` must be unused, writable and must stay
    /// valid forever, because allocations are handed out as `'static`.
    pub unsafe fn new(start: usize, end: usize) -> Self {
        let current = align_up(start, SMALLEST_CHUNK);
        assert!(
            current < end,
            "early allocator: invalid memory range {:#x}..{:#x}",
            start,
            end
        );

        Self {
            free: [0; CHUNK_ORDERS],
            current,
            end,
        }
    }

    /// Allocates `size` bytes aligned to [`SMALLEST_CHUNK`].
    pub fn alloc(&mut self, size: usize) -> NonNull<u8> {
        self.alloc_align(size, SMALLEST_CHUNK)
    }

    /// Allocates `size` bytes.
    ///
    /// Small requests are aligned to their rounded up size, which already
    /// satisfies any `align` up to that size. A zero sized request gets the
    /// smallest chunk.
    pub fn alloc_align(&mut self, size: usize, align: usize) -> NonNull<u8> {
        assert!(
            align.is_power_of_two(),
            "early allocator: alignment {:#x} is not a power of two",
            align
        );

        let chunk = size.max(SMALLEST_CHUNK).next_power_of_two();
        let addr = if chunk <= LARGEST_CHUNK && align <= chunk {
            let order = chunk.trailing_zeros() as usize;
            match self.take_chunk(order) {
                Some(addr) => addr,
                None => self.advance(chunk, chunk),
            }
        } else {
            self.advance(size, align)
        };

        NonNull::new(addr as *mut u8).expect("early allocator handed out a null pointer")
    }

    /// Allocates uninitialized storage for `len` values of `T`.
    pub fn alloc_array<T>(&mut self, len: usize) -> &'static mut [MaybeUninit<T>] {
        let size = mem::size_of::<T>()
            .checked_mul(len)
            .unwrap_or_else(|| panic!("early allocator: array of {} elements overflows", len));
        let ptr = self
            .alloc_align(size, mem::align_of::<T>())
            .cast::<MaybeUninit<T>>();

        // SAFETY
        // The memory is ours forever, and `MaybeUninit` needs no initialization.
        unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }
    }

    /// Moves `value` into storage that lives forever.
    pub fn alloc_value<T>(&mut self, value: T) -> &'static mut T {
        let ptr = self
            .alloc_align(mem::size_of::<T>(), mem::align_of::<T>())
            .cast::<T>();

        // SAFETY
        // The memory is ours forever and suitably aligned for `T`.
        unsafe {
            ptr.as_ptr().write(value);
            &mut *ptr.as_ptr()
        }
    }

    /// Returns the current pointer. Memory from here on was never handed out.
    pub fn end_ptr(&self) -> usize {
        self.current
    }

    fn advance(&mut self, size: usize, align: usize) -> usize {
        let aligned = align_up(self.current, align);
        let end = match aligned.checked_add(size) {
            Some(end) if end <= self.end => end,
            _ => panic!(
                "early allocator: out of memory allocating {:#x} bytes at {:#x}",
                size, aligned
            ),
        };

        if aligned > self.current {
            self.recycle(self.current, aligned);
        }
        self.current = end;
        aligned
    }

    /// Takes a chunk of `order`, splitting a larger one if needed.
    fn take_chunk(&mut self, order: usize) -> Option<usize> {
        if let Some(addr) = self.pop(order) {
            return Some(addr);
        }

        for larger in order + 1..=LARGEST_ORDER {
            if let Some(addr) = self.pop(larger) {
                let mut current = larger;
                while current > order {
                    current -= 1;
                    self.push(addr + (1 << current), current);
                }
                return Some(addr);
            }
        }
        None
    }

    /// Cuts `start..end` into aligned chunks. Fragments too small for a chunk are lost.
    fn recycle(&mut self, mut start: usize, end: usize) {
        while end.saturating_sub(start) >= SMALLEST_CHUNK {
            if start % SMALLEST_CHUNK != 0 {
                start = align_up(start, SMALLEST_CHUNK);
                continue;
            }

            let remaining = end - start;
            let mut order = (usize::BITS - 1 - remaining.leading_zeros()) as usize;
            order = order.min(LARGEST_ORDER);
            while start % (1 << order) != 0 {
                order -= 1;
            }

            self.push(start, order);
            start += 1 << order;
        }
    }

    fn push(&mut self, addr: usize, order: usize) {
        debug_assert!(addr % (1 << order) == 0);
        let idx = order - SMALLEST_ORDER;
        let chunk = Chunk {
            magic: CHUNK_MAGIC,
            size: 1 << order,
            next: self.free[idx],
        };

        // SAFETY
        // `addr` is an unused part of our memory, at least 32 bytes large and aligned.
        unsafe { ptr::write(addr as *mut Chunk, chunk) };
        self.free[idx] = addr;
    }

    fn pop(&mut self, order: usize) -> Option<usize> {
        let idx = order - SMALLEST_ORDER;
        let addr = self.free[idx];
        if addr == 0 {
            return None;
        }

        // SAFETY
        // Only `push` puts addresses onto the free lists.
        let chunk = unsafe { ptr::read(addr as *const Chunk) };
        assert!(
            chunk.magic == CHUNK_MAGIC && chunk.size == 1 << order,
            "early allocator: corrupted chunk at {:#x}",
            addr
        );
        self.free[idx] = chunk.next;
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem::PAGE_SIZE, testing};

    fn allocator(pages: usize) -> (usize, EarlyAllocator) {
        let base = testing::region(pages, LARGEST_CHUNK);
        let early = unsafe { EarlyAllocator::new(base, base + pages * PAGE_SIZE) };
        (base, early)
    }

    #[test]
    fn small_requests_are_aligned_to_their_size() {
        let (base, mut early) = allocator(16);
        let a = early.alloc(20).as_ptr() as usize;
        let b = early.alloc(100).as_ptr() as usize;
        let c = early.alloc(1000).as_ptr() as usize;

        assert_eq!(a, base);
        assert_eq!(b % 128, 0);
        assert_eq!(c % 1024, 0);
        assert_eq!(early.end_ptr(), c + 1024);
    }

    #[test]
    fn alignment_gaps_are_recycled() {
        let (base, mut early) = allocator(16);
        early.alloc(32);
        let page = early.alloc(PAGE_SIZE).as_ptr() as usize;
        assert_eq!(page, base + PAGE_SIZE);

        // the gap in front of the page serves the next small requests
        let small = early.alloc(64).as_ptr() as usize;
        assert!(small > base && small < page);
        assert_eq!(small % 64, 0);
        let larger = early.alloc(2048).as_ptr() as usize;
        assert_eq!(larger, base + 2048);
        assert_eq!(early.end_ptr(), page + PAGE_SIZE);
    }

    #[test]
    fn larger_chunks_are_split() {
        let (base, mut early) = allocator(64);
        early.alloc(32);
        // leaves 32..64 KiB-alignment worth of recycled chunks behind
        let big = early.alloc_align(LARGEST_CHUNK * 2, LARGEST_CHUNK).as_ptr() as usize;
        assert_eq!(big, base + LARGEST_CHUNK);

        let end = early.end_ptr();
        for _ in 0..4 {
            let chunk = early.alloc(256).as_ptr() as usize;
            assert!(chunk < big);
            assert_eq!(chunk % 256, 0);
        }
        assert_eq!(early.end_ptr(), end);
    }

    #[test]
    fn large_requests_respect_alignment() {
        let (base, mut early) = allocator(128);
        early.alloc(64);
        let large = early.alloc_align(3 * LARGEST_CHUNK / 2, 4 * PAGE_SIZE).as_ptr() as usize;
        assert_eq!(large, base + 4 * PAGE_SIZE);
        assert_eq!(early.end_ptr(), large + 3 * LARGEST_CHUNK / 2);
    }

    #[test]
    fn values_and_arrays_live_in_early_memory() {
        let (base, mut early) = allocator(4);
        let value = early.alloc_value([7u64; 4]);
        assert_eq!(value[3], 7);

        let array = early.alloc_array::<u64>(100);
        assert_eq!(array.len(), 100);
        assert_eq!(array.as_ptr() as usize % 8, 0);
        assert!((array.as_ptr() as usize) >= base);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn running_out_of_memory_panics() {
        let (_, mut early) = allocator(1);
        early.alloc(2 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "corrupted chunk")]
    fn corrupted_chunks_are_detected() {
        let (base, mut early) = allocator(4);
        early.alloc(32);
        early.alloc(128);
        // the 32..64 gap is now a free chunk
        unsafe { ptr::write((base + 32) as *mut u64, 0) };
        early.alloc(32);
    }
}
