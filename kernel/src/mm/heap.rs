//! First-fit kernel heap allocator
//!
//! Every allocation is preceded by an inline [`BlockHeader`]; blocks form
//! a singly-linked list in ascending address order. `allocate` takes the
//! first free block large enough (splitting when worthwhile), `release`
//! marks the block free and coalesces adjacent free neighbours. Payloads
//! are 16-byte aligned. Out of memory returns null, never aborts.

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;

use spin::Mutex;

/// Alignment guaranteed for every payload pointer.
pub const MIN_ALIGN: usize = 16;

/// Inline header preceding each payload.
///
/// `align(16)` pads the header to 32 bytes so a 16-byte-aligned header
/// puts the payload back on a 16-byte boundary.
#[repr(C, align(16))]
struct BlockHeader {
    /// Payload size in bytes (excluding the header), multiple of 16
    size: usize,
    /// Whether the block is currently free
    free: bool,
    /// Next block in ascending address order
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// The allocator proper. Operates on a caller-provided region; the
/// kernel hands it the RAM between BSS and the program load area, tests
/// hand it boxed buffers.
pub struct FirstFitHeap {
    head: *mut BlockHeader,
    start: usize,
    end: usize,
}

// SAFETY: the raw block pointers all point into the single region the
// heap was initialized over; access is serialized by the Mutex in
// LockedHeap (and by the single-threaded kernel elsewhere).
unsafe impl Send for FirstFitHeap {}

impl FirstFitHeap {
    /// An uninitialized heap; every allocation fails until `init`.
    pub const fn empty() -> Self {
        Self {
            head: ptr::null_mut(),
            start: 0,
            end: 0,
        }
    }

    /// Initialize over `[start, start + size)` with one spanning free
    /// block.
    ///
    /// # Safety
    ///
    /// The region must be valid, unused memory that outlives the heap,
    /// and `init` must not be called while allocations are live.
    pub unsafe fn init(&mut self, start: *mut u8, size: usize) {
        let aligned = align_up(start as usize, MIN_ALIGN);
        let slack = aligned - start as usize;
        debug_assert!(size > slack + HEADER_SIZE + MIN_ALIGN);

        self.start = aligned;
        self.end = start as usize + size;
        self.head = aligned as *mut BlockHeader;
        // SAFETY: caller guarantees the region; `aligned` is in bounds
        // and suitably aligned for BlockHeader. The initial payload size
        // is rounded down so later headers stay 16-byte aligned.
        unsafe {
            (*self.head).size = (self.end - aligned - HEADER_SIZE) & !(MIN_ALIGN - 1);
            (*self.head).free = true;
            (*self.head).next = ptr::null_mut();
        }
    }

    /// Allocate at least `size` bytes, 16-byte aligned. Returns null on
    /// exhaustion or before `init`.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.head.is_null() {
            return ptr::null_mut();
        }

        let size = align_up(size, MIN_ALIGN);
        let mut current = self.head;

        while !current.is_null() {
            // SAFETY: `current` walks the block list, whose nodes all
            // live inside the initialized region.
            unsafe {
                if (*current).free && (*current).size >= size {
                    // Split when the remainder can hold a header plus a
                    // minimum payload.
                    if (*current).size >= size + HEADER_SIZE + MIN_ALIGN {
                        let new_block =
                            (current as *mut u8).add(HEADER_SIZE + size) as *mut BlockHeader;
                        (*new_block).size = (*current).size - size - HEADER_SIZE;
                        (*new_block).free = true;
                        (*new_block).next = (*current).next;

                        (*current).size = size;
                        (*current).next = new_block;
                    }

                    (*current).free = false;
                    return (current as *mut u8).add(HEADER_SIZE);
                }
                current = (*current).next;
            }
        }

        ptr::null_mut()
    }

    /// Release a pointer previously returned by `allocate` (null is a
    /// no-op), then coalesce adjacent free blocks until none remain.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer from this heap's `allocate`;
    /// double frees corrupt the block list.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        // SAFETY: per the contract, ptr sits HEADER_SIZE past its header.
        unsafe {
            let block = ptr.sub(HEADER_SIZE) as *mut BlockHeader;
            (*block).free = true;
        }

        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: list nodes are all inside the region; merging a
            // block with its successor keeps the list well-formed.
            unsafe {
                let next = (*current).next;
                if (*current).free && !next.is_null() && (*next).free {
                    (*current).size += HEADER_SIZE + (*next).size;
                    (*current).next = (*next).next;
                    // Re-check this block: it may now also touch the one
                    // after the merged neighbour.
                } else {
                    current = (*current).next;
                }
            }
        }
    }

    /// Resize an allocation, preserving `min(old, new)` bytes.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::release`] for `ptr`.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.release(ptr) };
            return ptr::null_mut();
        }

        // SAFETY: ptr came from allocate, so its header is in place.
        let old_size = unsafe { (*(ptr.sub(HEADER_SIZE) as *mut BlockHeader)).size };
        if old_size >= size {
            return ptr;
        }

        let new_ptr = self.allocate(size);
        if !new_ptr.is_null() {
            // SAFETY: both pointers reference at least old_size valid
            // bytes and cannot overlap (new_ptr is a fresh block).
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, old_size);
                self.release(ptr);
            }
        }
        new_ptr
    }

    /// Allocate `count * size` zeroed bytes.
    pub fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(t) => t,
            None => return ptr::null_mut(),
        };
        let ptr = self.allocate(total);
        if !ptr.is_null() {
            // SAFETY: allocate returned at least `total` writable bytes.
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    /// Bytes currently handed out (headers included).
    pub fn used_bytes(&self) -> usize {
        self.walk(|h| if h.free { 0 } else { h.size + HEADER_SIZE })
    }

    /// Bytes available across all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.walk(|h| if h.free { h.size } else { 0 })
    }

    /// Largest single free block payload.
    pub fn largest_free_block(&self) -> usize {
        let mut largest = 0;
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: list nodes live inside the region.
            unsafe {
                if (*current).free && (*current).size > largest {
                    largest = (*current).size;
                }
                current = (*current).next;
            }
        }
        largest
    }

    /// Start of the managed region (after alignment).
    pub fn region_start(&self) -> usize {
        self.start
    }

    /// One past the end of the managed region.
    pub fn region_end(&self) -> usize {
        self.end
    }

    fn walk(&self, mut f: impl FnMut(&BlockHeader) -> usize) -> usize {
        let mut total = 0;
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: list nodes live inside the region.
            unsafe {
                total += f(&*current);
                current = (*current).next;
            }
        }
        total
    }
}

/// Mutex-wrapped heap usable as the `#[global_allocator]` on bare metal.
pub struct LockedHeap {
    inner: Mutex<FirstFitHeap>,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(FirstFitHeap::empty()),
        }
    }

    /// Initialize the wrapped heap over a region.
    ///
    /// # Safety
    ///
    /// Same contract as [`FirstFitHeap::init`].
    pub unsafe fn init(&self, start: *mut u8, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.lock().init(start, size) };
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, FirstFitHeap> {
        self.inner.lock()
    }

    pub fn region_start(&self) -> usize {
        self.inner.lock().region_start()
    }

    pub fn region_end(&self) -> usize {
        self.inner.lock().region_end()
    }
}

// SAFETY: the allocator never unwinds and hands out pointers only from
// its own region. Alignments above MIN_ALIGN are refused (null) rather
// than mis-served; nothing in the kernel requests them.
unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_ALIGN {
            return ptr::null_mut();
        }
        self.inner.lock().allocate(layout.size().max(1))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: GlobalAlloc contract guarantees ptr came from alloc.
        unsafe { self.inner.lock().release(ptr) };
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    const REGION: usize = 64 * 1024;

    fn heap_over(buf: &mut [u8]) -> FirstFitHeap {
        let mut heap = FirstFitHeap::empty();
        unsafe { heap.init(buf.as_mut_ptr(), buf.len()) };
        heap
    }

    #[test]
    fn alloc_returns_aligned_distinct_pointers() {
        let mut buf = vec![0u8; REGION];
        let mut heap = heap_over(&mut buf);

        let a = heap.allocate(10);
        let b = heap.allocate(100);
        let c = heap.allocate(1);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a as usize % MIN_ALIGN, 0);
        assert_eq!(b as usize % MIN_ALIGN, 0);
        assert_eq!(c as usize % MIN_ALIGN, 0);
        // Blocks must not overlap: writing one leaves the others intact.
        unsafe {
            ptr::write_bytes(a, 0xAA, 10);
            ptr::write_bytes(b, 0xBB, 100);
            ptr::write_bytes(c, 0xCC, 1);
            assert_eq!(*a, 0xAA);
            assert_eq!(*b.add(99), 0xBB);
            assert_eq!(*c, 0xCC);
        }
    }

    #[test]
    fn release_coalesces_back_to_one_block() {
        let mut buf = vec![0u8; REGION];
        let mut heap = heap_over(&mut buf);
        let initial = heap.largest_free_block();

        let ptrs: Vec<*mut u8> = (0..8).map(|i| heap.allocate(64 + i * 48)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        assert!(heap.largest_free_block() < initial);

        // Free in a scrambled order; coalescing must still recover the
        // single spanning block.
        for &i in &[3usize, 0, 7, 1, 5, 2, 6, 4] {
            unsafe { heap.release(ptrs[i]) };
        }
        assert_eq!(heap.largest_free_block(), initial);
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn allocation_succeeds_while_space_remains() {
        let mut buf = vec![0u8; REGION];
        let mut heap = heap_over(&mut buf);

        // Fill-and-drain repeatedly: fragmentation from a churn pattern
        // must not leak space.
        for _ in 0..10 {
            let mut live = Vec::new();
            loop {
                let p = heap.allocate(1024);
                if p.is_null() {
                    break;
                }
                live.push(p);
            }
            assert!(live.len() >= REGION / (1024 + 64) - 1);
            for p in live {
                unsafe { heap.release(p) };
            }
        }
    }

    #[test]
    fn out_of_memory_returns_null() {
        let mut buf = vec![0u8; 4096];
        let mut heap = heap_over(&mut buf);
        assert!(heap.allocate(1 << 20).is_null());
        assert!(heap.allocate(0).is_null());
    }

    #[test]
    fn release_null_is_noop() {
        let mut buf = vec![0u8; 4096];
        let mut heap = heap_over(&mut buf);
        unsafe { heap.release(ptr::null_mut()) };
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn reallocate_preserves_prefix() {
        let mut buf = vec![0u8; REGION];
        let mut heap = heap_over(&mut buf);

        let p = heap.allocate(32);
        unsafe {
            for i in 0..32 {
                *p.add(i) = i as u8;
            }
            let q = heap.reallocate(p, 512);
            assert!(!q.is_null());
            for i in 0..32 {
                assert_eq!(*q.add(i), i as u8);
            }
            // Shrinking keeps the block in place.
            let r = heap.reallocate(q, 16);
            assert_eq!(q, r);
            heap.release(r);
        }
    }

    #[test]
    fn zero_allocate_zeroes() {
        let mut buf = vec![0u8; REGION];
        let mut heap = heap_over(&mut buf);
        buf_fill_marker(&mut heap);

        let p = heap.zero_allocate(16, 33);
        assert!(!p.is_null());
        unsafe {
            for i in 0..16 * 33 {
                assert_eq!(*p.add(i), 0);
            }
            heap.release(p);
        }
        assert!(heap.zero_allocate(usize::MAX, 2).is_null());
    }

    // Dirty the region so zero_allocate has something to prove.
    fn buf_fill_marker(heap: &mut FirstFitHeap) {
        let p = heap.allocate(2048);
        unsafe {
            ptr::write_bytes(p, 0x5A, 2048);
            heap.release(p);
        }
    }

    #[test]
    fn split_leaves_usable_remainder() {
        let mut buf = vec![0u8; 4096];
        let mut heap = heap_over(&mut buf);

        let big = heap.largest_free_block();
        let p = heap.allocate(big - HEADER_SIZE - MIN_ALIGN);
        assert!(!p.is_null());
        // The split remainder must still be allocatable.
        let q = heap.allocate(MIN_ALIGN);
        assert!(!q.is_null());
    }
}
