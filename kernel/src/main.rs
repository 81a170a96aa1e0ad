//! VibeOS kernel binary
//!
//! Bare-metal entry for the AArch64 boards. The platform loader jumps
//! to `_start` at EL1 with interrupts masked, SP set and BSS zeroed;
//! everything else happens in `bootstrap::kernel_main`.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
#[no_mangle]
#[link_section = ".text._start"]
pub extern "C" fn _start() -> ! {
    vibeos_kernel::bootstrap::kernel_main()
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    vibeos_kernel::serial_println!("[PANIC] {}", info);
    vibeos_kernel::arch::halt()
}

// Host builds only exist so `cargo build` succeeds alongside the test
// targets; the kernel does nothing off bare metal.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("vibeos-kernel is a bare-metal image; run it under QEMU or on a Pi Zero 2W.");
}
