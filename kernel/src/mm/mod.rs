//! Memory management
//!
//! The kernel heap is a first-fit allocator with inline block headers,
//! spanning the RAM between the end of the kernel image and the program
//! load area. Programs share it through the kapi malloc/free family.

pub mod heap;

pub use heap::{FirstFitHeap, LockedHeap};

/// Start of the program load region. ELF executables link against
/// addresses at or above this; the heap must end below it.
pub const PROGRAM_LOAD_AREA: usize = 0x4100_0000;

/// Guard gap left between the end of BSS and the heap, covering the
/// boot stack that the platform loader placed there.
pub const HEAP_GUARD: usize = 0x1_0000;

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Initialize the global kernel heap over `[__bss_end + HEAP_GUARD,
/// PROGRAM_LOAD_AREA)`. Bare-metal only; host tests construct their own
/// [`FirstFitHeap`] over owned buffers.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn init() {
    extern "C" {
        static __bss_end: u8;
    }

    // SAFETY: __bss_end is provided by the linker script and marks the
    // first byte past the kernel image. Everything from there (plus the
    // guard gap) up to the program load area is unused RAM on both
    // supported boards, and init runs once, single-threaded, at boot.
    unsafe {
        let start = align_up(core::ptr::addr_of!(__bss_end) as usize + HEAP_GUARD, 16);
        let size = PROGRAM_LOAD_AREA - start;
        crate::ALLOCATOR.init(start as *mut u8, size);
    }

    println!(
        "[MEM] Heap: {:#x} - {:#x}",
        crate::ALLOCATOR.region_start(),
        crate::ALLOCATOR.region_end()
    );
}
