//! VibeOS kernel library
//!
//! The core of a small monolithic AArch64 kernel: HAL, first-fit heap,
//! ELF64 loader, FAT32, framebuffer console, network core, cooperative
//! process substrate and the kapi function table. The bare-metal binary
//! in `main.rs` instantiates it at boot; on host targets the same
//! modules compile against `std` so the unit tests run with
//! `cargo test` over RAM-backed devices.

#![no_std]

extern crate alloc;

// Host (test) builds link std and use the system allocator so Vec,
// String and friends work in test code without the kernel heap.
#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod console;
pub mod drivers;
pub mod elf;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod hal;
pub mod kapi;
pub mod logger;
pub mod mm;
pub mod net;
pub mod process;
pub mod wm;

use mm::LockedHeap;

/// The kernel heap. On bare metal it is the global allocator, spanning
/// the RAM between BSS and the program load area; on hosts it backs
/// only the kapi malloc family (test code allocates through std).
#[cfg_attr(all(target_arch = "aarch64", target_os = "none"), global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
fn ensure_program_heap() {
    use spin::Once;
    static INIT: Once<()> = Once::new();
    static mut HOST_HEAP: [u8; 1 << 20] = [0; 1 << 20];
    INIT.call_once(|| {
        // SAFETY: one static region, initialized exactly once.
        unsafe { ALLOCATOR.init(core::ptr::addr_of_mut!(HOST_HEAP) as *mut u8, 1 << 20) };
    });
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
fn ensure_program_heap() {
    // mm::init set the region up during boot.
}

/// kapi malloc: at least `size` bytes, 16-byte aligned, null on
/// exhaustion.
pub fn heap_alloc(size: usize) -> *mut u8 {
    ensure_program_heap();
    ALLOCATOR.lock().allocate(size)
}

/// kapi free.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from [`heap_alloc`].
pub unsafe fn heap_free(ptr: *mut u8) {
    ensure_program_heap();
    // SAFETY: forwarded caller contract.
    unsafe { ALLOCATOR.lock().release(ptr) };
}

/// kapi realloc.
///
/// # Safety
///
/// Same contract as [`heap_free`].
pub unsafe fn heap_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    ensure_program_heap();
    // SAFETY: forwarded caller contract.
    unsafe { ALLOCATOR.lock().reallocate(ptr, size) }
}

/// kapi calloc: zeroed `count * size` bytes.
pub fn heap_calloc(count: usize, size: usize) -> *mut u8 {
    ensure_program_heap();
    ALLOCATOR.lock().zero_allocate(count, size)
}

/// Bytes currently allocated from the kernel heap.
pub fn heap_used() -> usize {
    ensure_program_heap();
    ALLOCATOR.lock().used_bytes()
}

/// Bytes still available on the kernel heap.
pub fn heap_free_bytes() -> usize {
    ensure_program_heap();
    ALLOCATOR.lock().free_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kapi_heap_round_trip() {
        let p = heap_alloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0);

        let q = heap_calloc(4, 25);
        assert!(!q.is_null());
        unsafe {
            for i in 0..100 {
                assert_eq!(*q.add(i), 0);
            }
            let r = heap_realloc(p, 400);
            assert!(!r.is_null());
            heap_free(r);
            heap_free(q);
        }
    }
}
